//! # Relay Sessions
//!
//! Per-connection state shared by the relay tasks.
//!
//! ## Key Components:
//! - **Model**: turns, transcript, audio chunks and format state
//! - **Queue**: bounded pending-audio queue (backpressure instead of drops)
//! - **Registry**: the single table of live sessions

pub mod model;
pub mod queue;
pub mod registry;

pub use model::{AudioChunk, AudioTransport, Role, SessionPhase, Turn};
pub use queue::{audio_queue, AudioConsumer, AudioProducer};
pub use registry::{Session, SessionId, SessionRegistry};

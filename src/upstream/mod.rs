//! # Upstream Live Session
//!
//! The relay consumes the streaming AI service only through the traits in this module.
//! A connection is split into a write half ([`LiveSender`], shared by the upstream
//! relay and the ingress reader) and a read half ([`LiveEvents`], owned by the event
//! relay), so sending audio never waits on receiving events.
//!
//! ## Event Model:
//! Upstream responses are a closed set of tagged variants ([`UpstreamEvent`]); the
//! event relay dispatches on the tag instead of probing optional fields.

pub mod gemini;

use crate::error::AppResult;
use crate::session::AudioChunk;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use gemini::GeminiLiveConnector;

/// Default format of model audio when the service does not declare one.
pub const DEFAULT_MODEL_AUDIO_MIME: &str = "audio/pcm;rate=24000";

/// One event from the live session.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// A renewable handle that lets a later connection continue this conversation
    ResumptionUpdate { handle: String },
    /// The service will terminate the connection soon
    GoAway { time_left: Option<String> },
    /// The model's current reply was interrupted
    Interrupted,
    /// Inline audio from the model
    ModelTurnAudio { data: Vec<u8>, mime: Option<String> },
    /// The model finished its turn
    TurnComplete,
    /// Transcript of the model's speech
    OutputTranscript { text: String },
    /// Transcript of the user's speech
    InputTranscript { text: String },
}

/// Everything needed to open one live session.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub resumption_handle: Option<String>,
}

/// Opens live sessions.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self, setup: LiveSetup) -> AppResult<LiveSession>;
}

/// Write half of a live session.
#[async_trait]
pub trait LiveSender: Send + Sync {
    /// Forward one audio chunk as realtime input, labelled with its own format tag.
    async fn send_audio(&self, chunk: &AudioChunk) -> AppResult<()>;

    /// Forward typed user text.
    async fn send_text(&self, text: &str) -> AppResult<()>;

    /// Whether this session accepts typed text at all.
    fn supports_text(&self) -> bool {
        true
    }

    /// Close the connection. Called exactly once, through [`UpstreamLink::release`].
    async fn close(&self) -> AppResult<()>;
}

/// Read half of a live session. One pass only; it cannot be restarted.
#[async_trait]
pub trait LiveEvents: Send {
    /// Next event, or `None` when the service closed the stream.
    async fn next_event(&mut self) -> Option<AppResult<UpstreamEvent>>;
}

/// An open live session, split into halves.
pub struct LiveSession {
    pub sender: Arc<dyn LiveSender>,
    pub events: Box<dyn LiveEvents>,
}

impl fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSession").finish_non_exhaustive()
    }
}

/// Shared handle to the write half that guarantees a single close.
///
/// Every task that sees the session ending may call [`UpstreamLink::release`]; only
/// the first call reaches the service.
pub struct UpstreamLink {
    sender: Arc<dyn LiveSender>,
    released: AtomicBool,
}

impl UpstreamLink {
    pub fn new(sender: Arc<dyn LiveSender>) -> Self {
        Self {
            sender,
            released: AtomicBool::new(false),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub async fn send_audio(&self, chunk: &AudioChunk) -> AppResult<()> {
        self.sender.send_audio(chunk).await
    }

    pub async fn send_text(&self, text: &str) -> AppResult<()> {
        self.sender.send_text(text).await
    }

    /// A live text input exists while the link is open and the session accepts text.
    pub fn accepts_text(&self) -> bool {
        !self.is_released() && self.sender.supports_text()
    }

    /// Close the upstream session. Returns `true` for the call that actually closed it.
    pub async fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(err) = self.sender.close().await {
            tracing::warn!("Closing upstream session failed: {}", err);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::FakeSender;

    #[tokio::test]
    async fn test_release_closes_once() {
        let sender = Arc::new(FakeSender::default());
        let link = Arc::new(UpstreamLink::new(sender.clone()));

        let (a, b, c) = tokio::join!(link.release(), link.release(), link.release());
        assert_eq!([a, b, c].iter().filter(|closed| **closed).count(), 1);
        assert_eq!(sender.close_count(), 1);
        assert!(!link.accepts_text());
    }
}

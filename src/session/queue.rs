//! Bounded pending-audio queue between the ingress reader and the upstream relay.
//!
//! Single producer, single consumer. A full queue suspends the producer instead of
//! dropping audio; an empty queue suspends the consumer.

use crate::session::model::AudioChunk;
use tokio::sync::mpsc;

/// Create a queue holding at most `capacity` chunks.
pub fn audio_queue(capacity: usize) -> (AudioProducer, AudioConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (AudioProducer { tx }, AudioConsumer { rx })
}

/// Ingress side of the queue.
#[derive(Debug)]
pub struct AudioProducer {
    tx: mpsc::Sender<AudioChunk>,
}

impl AudioProducer {
    /// Enqueue a chunk, waiting for room if the queue is full.
    ///
    /// Returns `false` once the consumer is gone (the session is tearing down).
    pub async fn push(&self, chunk: AudioChunk) -> bool {
        self.tx.send(chunk).await.is_ok()
    }

    /// Free slots right now. Only used for diagnostics.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// Upstream relay side of the queue.
#[derive(Debug)]
pub struct AudioConsumer {
    rx: mpsc::Receiver<AudioChunk>,
}

impl AudioConsumer {
    /// Next chunk in FIFO order, or `None` after the producer is dropped and drained.
    pub async fn pop(&mut self) -> Option<AudioChunk> {
        self.rx.recv().await
    }
}

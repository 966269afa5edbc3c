//! Upstream relay: drains the audio queue into the live session.

use super::TaskExit;
use crate::session::{AudioConsumer, Session};
use crate::upstream::UpstreamLink;
use std::sync::Arc;
use tracing::warn;

/// Forward queued chunks in FIFO order, each with the format it was enqueued with.
///
/// Parks on an empty queue. A failed send is logged and the next chunk is tried.
pub(crate) async fn forward_audio(mut queue: AudioConsumer, link: Arc<UpstreamLink>, session: Arc<Session>) -> TaskExit {
    while let Some(chunk) = queue.pop().await {
        if let Err(err) = link.send_audio(&chunk).await {
            warn!(
                user = %session.user_id,
                bytes = chunk.data.len(),
                mime = %chunk.mime,
                "Error forwarding audio upstream: {}",
                err
            );
        }
    }
    TaskExit::QueueClosed
}

//! Event relay: live session events → client frames and transcript turns.

use super::{forward, ClientSink, TaskExit};
use crate::protocol::ServerFrame;
use crate::session::{Role, Session};
use crate::upstream::{LiveEvents, UpstreamEvent, DEFAULT_MODEL_AUDIO_MIME};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use tracing::{debug, info, warn};

const INTERRUPTED_NOTICE: &str = "Response interrupted by user input";

/// Consume the event stream in emission order until it ends or fails.
pub(crate) async fn relay_events(
    mut events: Box<dyn LiveEvents>,
    sink: Arc<dyn ClientSink>,
    session: Arc<Session>,
) -> TaskExit {
    loop {
        match events.next_event().await {
            Some(Ok(event)) => handle_event(event, sink.as_ref(), &session),
            Some(Err(err)) if err.is_fatal_for_session() => return TaskExit::UpstreamFailed(err),
            Some(Err(err)) => warn!("Dropping upstream message: {}", err),
            None => return TaskExit::UpstreamClosed,
        }
    }
}

fn handle_event(event: UpstreamEvent, sink: &dyn ClientSink, session: &Session) {
    match event {
        UpstreamEvent::ResumptionUpdate { handle } => {
            info!(handle = %handle, "New resumption handle");
            session.set_resumption_handle(handle.clone());
            forward(sink, ServerFrame::SessionId { data: handle });
        }
        UpstreamEvent::GoAway { time_left } => {
            info!("Live session will terminate in: {}", time_left.as_deref().unwrap_or("unknown"));
        }
        UpstreamEvent::Interrupted => {
            info!("Interruption detected");
            forward(sink, ServerFrame::Interrupted { data: INTERRUPTED_NOTICE.to_string() });
        }
        UpstreamEvent::ModelTurnAudio { data, mime } => {
            session.record_audio_out();
            forward(
                sink,
                ServerFrame::Audio {
                    data: BASE64.encode(data),
                    mime: mime.unwrap_or_else(|| DEFAULT_MODEL_AUDIO_MIME.to_string()),
                },
            );
        }
        UpstreamEvent::TurnComplete => {
            debug!("Model turn complete");
            forward(sink, ServerFrame::TurnComplete);
        }
        UpstreamEvent::OutputTranscript { text } => {
            forward(sink, ServerFrame::Text { data: text.clone() });
            session.transcript.append(Role::Assistant, &text);
        }
        UpstreamEvent::InputTranscript { text } => {
            session.transcript.append(Role::User, &text);
        }
    }
}

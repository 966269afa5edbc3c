//! # Session Relay
//!
//! Runs one client connection end to end, independent of the transport it arrived on.
//!
//! ## Session Flow:
//! 1. **Ready**: `ready` frame is sent as soon as the connection is accepted
//! 2. **Handshake**: first frame must be `user_id`, within the handshake timeout
//! 3. **Register**: session enters the registry, live session is opened
//! 4. **Relay**: three tasks run concurrently in one [`JoinSet`]
//!    - ingress reader: client frames → queue / transcript / coordinator
//!    - upstream relay: queue → live session
//!    - event relay: live session → client frames / transcript
//! 5. **Teardown**: the first task to finish cancels the other two, the live session
//!    is released once and the registry entry is removed
//!
//! The transport side is abstracted by an inbound frame channel and a [`ClientSink`],
//! so the same runtime serves the actix WebSocket actor and the tests.

pub mod events;
pub mod handshake;
pub mod ingress;
pub mod uplink;

#[cfg(test)]
pub mod testing;

use crate::backend::ProfileBackend;
use crate::config::{AppConfig, FeatureToggles};
use crate::error::{AppError, AppResult};
use crate::instructions::personalized_instruction;
use crate::protocol::{CloseStatus, InboundFrame, ServerFrame};
use crate::session::{audio_queue, Session, SessionPhase, SessionRegistry};
use crate::summary::{Summarizer, SummaryCoordinator};
use crate::upstream::{LiveConnector, LiveSetup, UpstreamLink};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

/// Write side of the client transport.
///
/// Sends never block the caller; a failed send is reported and the caller decides
/// whether it matters (it never does for the relay tasks).
pub trait ClientSink: Send + Sync {
    fn send(&self, frame: ServerFrame) -> AppResult<()>;

    fn close(&self, status: CloseStatus, reason: &str);
}

/// Send a frame, logging instead of failing.
pub(crate) fn forward(sink: &dyn ClientSink, frame: ServerFrame) {
    let kind = frame.kind();
    if let Err(err) = sink.send(frame) {
        warn!(frame = kind, "Error sending frame to client: {}", err);
    }
}

/// Process-wide relay counters.
#[derive(Debug, Default)]
pub struct RelayCounters {
    sessions_accepted: AtomicU64,
    handshake_rejections: AtomicU64,
    upstream_failures: AtomicU64,
    summaries_completed: AtomicU64,
    summaries_soft_failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayCountersSnapshot {
    pub sessions_accepted: u64,
    pub handshake_rejections: u64,
    pub upstream_failures: u64,
    pub summaries_completed: u64,
    pub summaries_soft_failed: u64,
}

impl RelayCounters {
    pub(crate) fn record_summary(&self, failed: bool) {
        let counter = if failed { &self.summaries_soft_failed } else { &self.summaries_completed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayCountersSnapshot {
        RelayCountersSnapshot {
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            handshake_rejections: self.handshake_rejections.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            summaries_completed: self.summaries_completed.load(Ordering::Relaxed),
            summaries_soft_failed: self.summaries_soft_failed.load(Ordering::Relaxed),
        }
    }
}

/// Long-lived collaborators shared by every session.
pub struct RelayServices {
    pub registry: Arc<SessionRegistry>,
    pub connector: Arc<dyn LiveConnector>,
    pub summarizer: Arc<dyn Summarizer>,
    pub backend: Arc<dyn ProfileBackend>,
    pub base_instruction: String,
    pub counters: Arc<RelayCounters>,
}

/// Configuration a session captures when it is accepted. Later config updates
/// only affect new sessions.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub handshake_timeout: Duration,
    pub audio_queue_capacity: usize,
    pub default_audio_mime: String,
    pub model: String,
    pub voice: String,
    pub summarizer_temperature: f32,
    pub features: FeatureToggles,
}

impl RelaySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            handshake_timeout: config.session.handshake_timeout(),
            audio_queue_capacity: config.session.audio_queue_capacity,
            default_audio_mime: config.session.default_audio_mime.clone(),
            model: config.upstream.model.clone(),
            voice: config.upstream.voice.clone(),
            summarizer_temperature: config.summarizer.temperature,
            features: config.features.clone(),
        }
    }
}

/// Why one of the three session tasks stopped.
#[derive(Debug)]
pub(crate) enum TaskExit {
    /// Client transport closed
    ClientClosed,
    /// Audio queue closed underneath the task
    QueueClosed,
    /// Live session ended its event stream
    UpstreamClosed,
    /// Live session failed
    UpstreamFailed(AppError),
}

/// Run one client connection to completion.
pub async fn run_session(
    mut inbound: mpsc::Receiver<InboundFrame>,
    sink: Arc<dyn ClientSink>,
    services: Arc<RelayServices>,
    settings: RelaySettings,
) {
    forward(sink.as_ref(), ServerFrame::Ready);

    let handshake = match handshake::await_handshake(&mut inbound, settings.handshake_timeout).await {
        Ok(handshake) => handshake,
        Err(err) => {
            services.counters.handshake_rejections.fetch_add(1, Ordering::Relaxed);
            warn!("Rejecting connection: {}", err);
            sink.close(CloseStatus::PolicyViolation, &handshake::close_reason(&err));
            return;
        }
    };

    let session = Arc::new(Session::new(handshake.user_id.clone(), &settings.default_audio_mime));
    let id = match services.registry.register(session.clone()) {
        Ok(id) => id,
        Err(err) => {
            warn!(user = %handshake.user_id, "Refusing session: {}", err);
            sink.close(CloseStatus::TryAgainLater, "too many sessions");
            return;
        }
    };
    services.counters.sessions_accepted.fetch_add(1, Ordering::Relaxed);

    let span = info_span!("session", id = %id, user = %session.user_id);
    async {
        info!(resume = handshake.resume.is_some(), "Session registered");
        let status = relay(inbound, sink.clone(), &services, &settings, session.clone(), handshake.resume).await;

        session.advance_phase(SessionPhase::Closed);
        services.registry.remove(&id);
        if let Some((status, reason)) = status {
            sink.close(status, reason);
        }
        info!("Session closed");
    }
    .instrument(span)
    .await
}

/// Open the live session and run the task group. Returns the close status to send,
/// if the client transport is still there to receive one.
async fn relay(
    inbound: mpsc::Receiver<InboundFrame>,
    sink: Arc<dyn ClientSink>,
    services: &RelayServices,
    settings: &RelaySettings,
    session: Arc<Session>,
    resume: Option<String>,
) -> Option<(CloseStatus, &'static str)> {
    let system_instruction = if settings.features.dynamic_greeting {
        personalized_instruction(
            &services.base_instruction,
            &session.user_id,
            services.backend.as_ref(),
            services.summarizer.as_ref(),
        )
        .await
    } else {
        services.base_instruction.clone()
    };

    let setup = LiveSetup {
        model: settings.model.clone(),
        voice: settings.voice.clone(),
        system_instruction,
        resumption_handle: resume,
    };

    let live = match services.connector.connect(setup).await {
        Ok(live) => live,
        Err(err) => {
            services.counters.upstream_failures.fetch_add(1, Ordering::Relaxed);
            error!("Could not open live session: {}", err);
            return Some((CloseStatus::Error, "live session unavailable"));
        }
    };

    let link = Arc::new(UpstreamLink::new(live.sender));
    let (producer, consumer) = audio_queue(settings.audio_queue_capacity);
    let coordinator = Arc::new(SummaryCoordinator::new(
        services.summarizer.clone(),
        services.backend.clone(),
        settings.features.clone(),
        settings.summarizer_temperature,
    ));

    let ingress = ingress::Ingress {
        session: session.clone(),
        producer,
        link: link.clone(),
        sink: sink.clone(),
        coordinator,
        counters: services.counters.clone(),
    };

    let mut tasks = JoinSet::new();
    tasks.spawn(ingress.run(inbound).in_current_span());
    tasks.spawn(uplink::forward_audio(consumer, link.clone(), session.clone()).in_current_span());
    tasks.spawn(events::relay_events(live.events, sink, session.clone()).in_current_span());

    let first = tasks.join_next().await;
    session.advance_phase(SessionPhase::Ending);
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    link.release().await;

    match first {
        Some(Ok(TaskExit::ClientClosed)) => {
            info!("Client disconnected");
            None
        }
        Some(Ok(TaskExit::UpstreamClosed)) => {
            info!("Live session ended");
            Some((CloseStatus::Normal, "live session ended"))
        }
        Some(Ok(TaskExit::UpstreamFailed(err))) => {
            services.counters.upstream_failures.fetch_add(1, Ordering::Relaxed);
            error!("Live session failed: {}", err);
            Some((CloseStatus::Error, "live session failed"))
        }
        Some(Ok(TaskExit::QueueClosed)) => Some((CloseStatus::Normal, "session ended")),
        Some(Err(err)) => {
            error!("Session task panicked: {}", err);
            Some((CloseStatus::Error, "internal error"))
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::session::AudioChunk;
    use crate::upstream::UpstreamEvent;

    const USER_ID: &str = r#"{"type":"user_id","data":"u1"}"#;

    fn text(frame: &str) -> InboundFrame {
        InboundFrame::Text(frame.to_string())
    }

    #[tokio::test]
    async fn test_first_frame_must_be_user_id() {
        let harness = Harness::new();
        let (tx, task) = harness.start();

        tx.send(text(r#"{"type":"text","data":"hi"}"#)).await.unwrap();
        tx.send(InboundFrame::Binary(vec![1, 2, 3, 4])).await.ok();
        within_a_second(task).await;

        assert_eq!(harness.sink.frames(), vec![ServerFrame::Ready]);
        assert_eq!(harness.sink.closes()[0].0, CloseStatus::PolicyViolation);
        assert_eq!(harness.connector.connect_count(), 0);
        assert_eq!(harness.services.registry.active_count(), 0);
        assert_eq!(harness.services.counters.snapshot().handshake_rejections, 1);
    }

    #[tokio::test]
    async fn test_handshake_timeout_closes_with_policy_violation() {
        let mut harness = Harness::new();
        harness.settings.handshake_timeout = Duration::from_millis(50);
        let (_tx, task) = harness.start();

        within_a_second(task).await;

        assert_eq!(harness.sink.closes(), vec![(CloseStatus::PolicyViolation, "user_id timeout".to_string())]);
        assert_eq!(harness.connector.connect_count(), 0);
        assert!(harness.sender.audio().is_empty());
    }

    #[tokio::test]
    async fn test_audio_keeps_order_and_enqueue_time_format() {
        let harness = Harness::gated();
        let (tx, task) = harness.start();

        tx.send(text(USER_ID)).await.unwrap();
        tx.send(InboundFrame::Binary(vec![1, 1])).await.unwrap();
        tx.send(text(r#"{"type":"client_settings","transport":{"audio":"base64","mime":"audio/webm"}}"#)).await.unwrap();
        tx.send(text(r#"{"type":"audio","data":"AgI="}"#)).await.unwrap();
        tx.send(InboundFrame::Binary(vec![3, 3])).await.unwrap();
        tx.send(text(r#"{"type":"ping"}"#)).await.unwrap();
        wait_until(|| harness.sink.frames().contains(&ServerFrame::Pong)).await;

        // Nothing has been forwarded yet; release the upstream side now
        assert!(harness.sender.audio().is_empty());
        harness.sender.release_permits(3);
        wait_until(|| harness.sender.audio().len() == 3).await;

        assert_eq!(
            harness.sender.audio(),
            vec![
                AudioChunk { data: vec![1, 1], mime: "audio/pcm;rate=16000".into() },
                AudioChunk { data: vec![2, 2], mime: "audio/webm".into() },
                AudioChunk { data: vec![3, 3], mime: "audio/webm".into() },
            ]
        );

        drop(tx);
        within_a_second(task).await;
    }

    #[tokio::test]
    async fn test_user_id_audio_text_end_scenario() {
        let harness = Harness::new();
        let (tx, task) = harness.start();

        tx.send(text(USER_ID)).await.unwrap();
        tx.send(InboundFrame::Binary(vec![0, 1, 2, 3])).await.unwrap();
        tx.send(text(r#"{"type":"text","data":"my name is Sam"}"#)).await.unwrap();
        tx.send(text(r#"{"type":"end"}"#)).await.unwrap();
        wait_until(|| harness.sink.frames().len() == 2).await;

        assert_eq!(
            harness.sink.frames(),
            vec![ServerFrame::Ready, ServerFrame::SummarySaved { data: "ok".into() }]
        );
        assert_eq!(harness.backend.saved_names(), vec![("u1".to_string(), "sam".to_string())]);

        let saved = harness.backend.saved_summaries();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].transcript.len(), 1);
        assert_eq!(saved[0].transcript[0].text, "my name is Sam");
        assert_eq!(harness.sender.texts(), vec!["my name is Sam".to_string()]);

        wait_until(|| harness.sender.audio().len() == 1).await;
        assert_eq!(harness.sender.audio()[0].data, vec![0, 1, 2, 3]);

        drop(tx);
        within_a_second(task).await;
        assert_eq!(harness.services.counters.snapshot().summaries_completed, 1);
    }

    #[tokio::test]
    async fn test_bad_frames_after_handshake_are_ignored() {
        let harness = Harness::new();
        let (tx, task) = harness.start();

        tx.send(text(USER_ID)).await.unwrap();
        for frame in [
            "{not json",
            r#"{"type":"volume","data":3}"#,
            r#"{"data":"no type"}"#,
            r#"{"type":"audio","data":"!!not base64!!"}"#,
            r#"{"type":"audio_base64","data":"%%%"}"#,
            r#"{"type":"user_id","data":"someone-else"}"#,
            r#"{"type":"ping"}"#,
        ] {
            tx.send(text(frame)).await.unwrap();
        }
        wait_until(|| harness.sink.frames().contains(&ServerFrame::Pong)).await;

        assert_eq!(harness.sink.frames(), vec![ServerFrame::Ready, ServerFrame::Pong]);
        assert!(harness.sink.closes().is_empty());
        assert!(harness.sender.audio().is_empty());
        assert!(harness.sender.texts().is_empty());

        let sessions = harness.services.registry.summaries();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].user_id, "u1");
        assert_eq!(sessions[0].turns, 0);
        assert_eq!(sessions[0].audio_chunks_in, 0);

        drop(tx);
        within_a_second(task).await;
    }

    #[tokio::test]
    async fn test_interrupted_then_audio_order() {
        let harness = Harness::new();
        let (tx, task) = harness.start();

        tx.send(text(USER_ID)).await.unwrap();
        wait_until(|| harness.connector.connect_count() == 1).await;

        harness.emit(UpstreamEvent::Interrupted);
        harness.emit(UpstreamEvent::ModelTurnAudio { data: vec![9, 9], mime: None });
        harness.emit(UpstreamEvent::OutputTranscript { text: "okay".into() });
        wait_until(|| harness.sink.frames().len() == 4).await;

        let kinds: Vec<_> = harness.sink.frames().iter().map(|f| f.kind()).collect();
        assert_eq!(kinds, vec!["ready", "interrupted", "audio", "text"]);
        assert_eq!(
            harness.sink.frames()[2],
            ServerFrame::Audio { data: "CQk=".into(), mime: "audio/pcm;rate=24000".into() }
        );

        drop(tx);
        within_a_second(task).await;
    }

    #[tokio::test]
    async fn test_client_close_cancels_parked_relay() {
        let harness = Harness::new();
        let (tx, task) = harness.start();

        tx.send(text(USER_ID)).await.unwrap();
        wait_until(|| harness.services.registry.active_count() == 1).await;

        // Upstream relay is parked on an empty queue and the event relay on the stream
        drop(tx);
        within_a_second(task).await;

        assert_eq!(harness.sender.close_count(), 1);
        assert_eq!(harness.services.registry.active_count(), 0);
        assert!(harness.sink.closes().is_empty());
        assert!(harness.events_closed());
    }

    #[tokio::test]
    async fn test_upstream_failure_tears_down_session() {
        let harness = Harness::new();
        let (tx, task) = harness.start();

        tx.send(text(USER_ID)).await.unwrap();
        wait_until(|| harness.connector.connect_count() == 1).await;
        harness.fail_upstream("socket reset");
        within_a_second(task).await;

        assert_eq!(harness.sink.closes()[0].0, CloseStatus::Error);
        assert_eq!(harness.sender.close_count(), 1);
        assert_eq!(harness.services.registry.active_count(), 0);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_connect_failure_closes_with_error() {
        let harness = Harness::with_failing_connector();
        let (tx, task) = harness.start();

        tx.send(text(USER_ID)).await.unwrap();
        within_a_second(task).await;

        assert_eq!(harness.sink.closes(), vec![(CloseStatus::Error, "live session unavailable".to_string())]);
        assert_eq!(harness.services.registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_handle_reaches_setup() {
        let harness = Harness::new();
        let (tx, task) = harness.start();

        tx.send(text(r#"{"type":"user_id","data":"u1","resume":"h-7"}"#)).await.unwrap();
        wait_until(|| harness.connector.connect_count() == 1).await;
        harness.emit(UpstreamEvent::ResumptionUpdate { handle: "h-8".into() });
        wait_until(|| harness.sink.frames().len() == 2).await;

        let setup = &harness.connector.setups()[0];
        assert_eq!(setup.resumption_handle.as_deref(), Some("h-7"));
        assert_eq!(setup.system_instruction, "You are a helpful AI assistant.");
        assert_eq!(harness.sink.frames()[1], ServerFrame::SessionId { data: "h-8".into() });

        drop(tx);
        within_a_second(task).await;
    }

    #[tokio::test]
    async fn test_full_registry_refuses_session() {
        let harness = Harness::with_capacity(0);
        let (tx, task) = harness.start();

        tx.send(text(USER_ID)).await.unwrap();
        within_a_second(task).await;

        assert_eq!(harness.sink.closes()[0].0, CloseStatus::TryAgainLater);
        assert_eq!(harness.connector.connect_count(), 0);
    }
}

//! In-process fakes for the relay's collaborators.

use super::{run_session, ClientSink, RelayCounters, RelayServices, RelaySettings};
use crate::backend::{ProfileBackend, SummaryRecord, UserProfile};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::protocol::{CloseStatus, InboundFrame, ServerFrame};
use crate::session::{AudioChunk, SessionRegistry};
use crate::summary::{GenerationRequest, Summarizer};
use crate::upstream::{LiveConnector, LiveEvents, LiveSender, LiveSession, LiveSetup, UpstreamEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

/// Records what the relay sent upstream.
#[derive(Default)]
pub struct FakeSender {
    audio: Mutex<Vec<AudioChunk>>,
    texts: Mutex<Vec<String>>,
    closes: AtomicUsize,
    /// When set, each audio send waits for a permit
    gate: Option<Arc<Semaphore>>,
}

impl FakeSender {
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn release_permits(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn audio(&self) -> Vec<AudioChunk> {
        self.audio.lock().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiveSender for FakeSender {
    async fn send_audio(&self, chunk: &AudioChunk) -> AppResult<()> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| AppError::Upstream(e.to_string()))?
                .forget();
        }
        self.audio.lock().push(chunk.clone());
        Ok(())
    }

    async fn send_text(&self, text: &str) -> AppResult<()> {
        self.texts.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeEvents {
    rx: mpsc::UnboundedReceiver<AppResult<UpstreamEvent>>,
}

impl FakeEvents {
    pub fn channel() -> (mpsc::UnboundedSender<AppResult<UpstreamEvent>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl LiveEvents for FakeEvents {
    async fn next_event(&mut self) -> Option<AppResult<UpstreamEvent>> {
        self.rx.recv().await
    }
}

/// Hands out one live session built from a [`FakeSender`] and a channel of events.
pub struct FakeConnector {
    session: Mutex<Option<LiveSession>>,
    setups: Mutex<Vec<LiveSetup>>,
    fail: bool,
}

impl FakeConnector {
    pub fn new(sender: Arc<FakeSender>) -> (Self, mpsc::UnboundedSender<AppResult<UpstreamEvent>>) {
        let (tx, events) = FakeEvents::channel();
        let session = LiveSession {
            sender,
            events: Box::new(events),
        };
        let connector = Self {
            session: Mutex::new(Some(session)),
            setups: Mutex::new(Vec::new()),
            fail: false,
        };
        (connector, tx)
    }

    pub fn connect_count(&self) -> usize {
        self.setups.lock().len()
    }

    pub fn setups(&self) -> Vec<LiveSetup> {
        self.setups.lock().clone()
    }
}

#[async_trait]
impl LiveConnector for FakeConnector {
    async fn connect(&self, setup: LiveSetup) -> AppResult<LiveSession> {
        self.setups.lock().push(setup);
        if self.fail {
            return Err(AppError::Upstream("connection refused".into()));
        }
        self.session
            .lock()
            .take()
            .ok_or_else(|| AppError::Upstream("fake live session already used".into()))
    }
}

/// Client sink that records frames and close requests.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<ServerFrame>>,
    closes: Mutex<Vec<(CloseStatus, String)>>,
    fail_writes: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn frames(&self) -> Vec<ServerFrame> {
        self.frames.lock().clone()
    }

    pub fn closes(&self) -> Vec<(CloseStatus, String)> {
        self.closes.lock().clone()
    }
}

impl ClientSink for RecordingSink {
    fn send(&self, frame: ServerFrame) -> AppResult<()> {
        if self.fail_writes {
            return Err(AppError::Transport("client went away".into()));
        }
        self.frames.lock().push(frame);
        Ok(())
    }

    fn close(&self, status: CloseStatus, reason: &str) {
        self.closes.lock().push((status, reason.to_string()));
    }
}

pub struct FakeSummarizer {
    reply: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeSummarizer {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Some(text.to_string()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for FakeSummarizer {
    async fn generate(&self, _request: GenerationRequest) -> AppResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply
            .clone()
            .ok_or_else(|| AppError::Collaborator("model unavailable".into()))
    }
}

#[derive(Default)]
pub struct FakeBackend {
    profile: Option<UserProfile>,
    fail_saves: bool,
    names: Mutex<Vec<(String, String)>>,
    summaries: Mutex<Vec<SummaryRecord>>,
}

impl FakeBackend {
    pub fn with_profile(profile: UserProfile) -> Self {
        Self {
            profile: Some(profile),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    pub fn saved_names(&self) -> Vec<(String, String)> {
        self.names.lock().clone()
    }

    pub fn saved_summaries(&self) -> Vec<SummaryRecord> {
        self.summaries.lock().clone()
    }
}

#[async_trait]
impl ProfileBackend for FakeBackend {
    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn get_user(&self, _user_id: &str) -> AppResult<Option<UserProfile>> {
        Ok(self.profile.clone())
    }

    async fn get_summary(&self, _user_id: &str) -> AppResult<Option<String>> {
        Ok(None)
    }

    async fn save_summary(&self, record: &SummaryRecord) -> AppResult<String> {
        if self.fail_saves {
            return Err(AppError::Collaborator("backend down".into()));
        }
        self.summaries.lock().push(record.clone());
        Ok("ok".to_string())
    }

    async fn save_name(&self, user_id: &str, name: &str) -> AppResult<()> {
        if self.fail_saves {
            return Err(AppError::Collaborator("backend down".into()));
        }
        self.names.lock().push((user_id.to_string(), name.to_string()));
        Ok(())
    }
}

/// A relay wired to fakes, plus handles to inspect them.
pub struct Harness {
    pub sender: Arc<FakeSender>,
    pub connector: Arc<FakeConnector>,
    pub backend: Arc<FakeBackend>,
    pub sink: Arc<RecordingSink>,
    pub services: Arc<RelayServices>,
    pub settings: RelaySettings,
    events: mpsc::UnboundedSender<AppResult<UpstreamEvent>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(FakeSender::default(), false, 4)
    }

    pub fn gated() -> Self {
        Self::build(FakeSender::gated(), false, 4)
    }

    pub fn with_failing_connector() -> Self {
        Self::build(FakeSender::default(), true, 4)
    }

    pub fn with_capacity(max_sessions: usize) -> Self {
        Self::build(FakeSender::default(), false, max_sessions)
    }

    fn build(sender: FakeSender, fail_connect: bool, max_sessions: usize) -> Self {
        let sender = Arc::new(sender);
        let (mut connector, events) = FakeConnector::new(sender.clone());
        connector.fail = fail_connect;
        let connector = Arc::new(connector);
        let backend = Arc::new(FakeBackend::default());
        let summarizer = Arc::new(FakeSummarizer::replying(r#"{"summary":"a short chat"}"#));

        let services = Arc::new(RelayServices {
            registry: Arc::new(SessionRegistry::new(max_sessions)),
            connector: connector.clone(),
            summarizer: summarizer.clone(),
            backend: backend.clone(),
            base_instruction: "You are a helpful AI assistant.".to_string(),
            counters: Arc::new(RelayCounters::default()),
        });

        Self {
            sender,
            connector,
            backend,
            sink: Arc::new(RecordingSink::default()),
            services,
            settings: RelaySettings::from_config(&AppConfig::default()),
            events,
        }
    }

    /// Spawn the session runtime; returns the client's frame sender and the task.
    pub fn start(&self) -> (mpsc::Sender<InboundFrame>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run_session(
            rx,
            self.sink.clone(),
            self.services.clone(),
            self.settings.clone(),
        ));
        (tx, task)
    }

    pub fn emit(&self, event: UpstreamEvent) {
        self.events.send(Ok(event)).ok();
    }

    pub fn fail_upstream(&self, reason: &str) {
        self.events.send(Err(AppError::Upstream(reason.to_string()))).ok();
    }

    /// The event stream's receiving side has been dropped.
    pub fn events_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Poll `condition` until it holds, failing the test after a second.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within a second");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn within_a_second(task: JoinHandle<()>) {
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("session did not finish within a second")
        .expect("session task panicked");
}

//! # Session Registry
//!
//! Tracks live relay sessions by an opaque session id. The registry is the only place
//! that adds or removes entries; everything else holds an id or an `Arc<Session>` and
//! must re-validate through [`SessionRegistry::lookup`] before acting on a session that
//! might already be gone.
//!
//! ## Session Lifecycle:
//! 1. **Registered**: created after a valid `user_id` handshake
//! 2. **Active**: all three relay tasks running
//! 3. **Ending**: one task stopped, the others are being cancelled
//! 4. **Closed**: upstream released, entry removed

use crate::error::{AppError, AppResult};
use crate::session::model::{AudioFormat, SessionPhase, Transcript};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Opaque identity of one client connection's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(SessionId)
            .map_err(|e| AppError::BadRequest(format!("Invalid session id '{}': {}", s, e)))
    }
}

/// Shared state of one relay session.
///
/// ## Thread Safety:
/// The ingress reader, upstream relay, event relay and the summarization coordinator
/// all hold an `Arc<Session>`. Each mutable field has its own lock so that, for
/// example, a resumption update never waits on a transcript append.
///
/// The transport and upstream handles are not stored here. They are owned by the
/// session's runtime in `relay`, so a registry lookup can never reach into them.
pub struct Session {
    pub id: SessionId,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    phase: RwLock<SessionPhase>,
    resumption_handle: RwLock<Option<String>>,
    audio_format: RwLock<AudioFormat>,
    pub transcript: Transcript,
    audio_chunks_in: AtomicU64,
    audio_chunks_out: AtomicU64,
    audio_bytes_in: AtomicU64,
}

impl Session {
    pub fn new(user_id: impl Into<String>, default_mime: &str) -> Self {
        Self {
            id: SessionId::new(),
            user_id: user_id.into(),
            created_at: Utc::now(),
            phase: RwLock::new(SessionPhase::Active),
            resumption_handle: RwLock::new(None),
            audio_format: RwLock::new(AudioFormat::new(default_mime)),
            transcript: Transcript::new(),
            audio_chunks_in: AtomicU64::new(0),
            audio_chunks_out: AtomicU64::new(0),
            audio_bytes_in: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.read()
    }

    /// Move the lifecycle forward. Never moves backwards (Closed stays Closed).
    pub fn advance_phase(&self, next: SessionPhase) {
        let mut phase = self.phase.write();
        let rank = |p: SessionPhase| match p {
            SessionPhase::Active => 0,
            SessionPhase::Ending => 1,
            SessionPhase::Closed => 2,
        };
        if rank(next) > rank(*phase) {
            *phase = next;
        }
    }

    pub fn resumption_handle(&self) -> Option<String> {
        self.resumption_handle.read().clone()
    }

    /// Last write wins.
    pub fn set_resumption_handle(&self, handle: String) {
        *self.resumption_handle.write() = Some(handle);
    }

    pub fn audio_format(&self) -> AudioFormat {
        self.audio_format.read().clone()
    }

    pub fn update_audio_format(&self, update: impl FnOnce(&mut AudioFormat)) -> AudioFormat {
        let mut format = self.audio_format.write();
        update(&mut format);
        format.clone()
    }

    pub fn record_audio_in(&self, bytes: usize) {
        self.audio_chunks_in.fetch_add(1, Ordering::Relaxed);
        self.audio_bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_audio_out(&self) {
        self.audio_chunks_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot used by the management API.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.to_string(),
            user_id: self.user_id.clone(),
            phase: self.phase().as_str(),
            created_at: self.created_at.to_rfc3339(),
            turns: self.transcript.len(),
            audio_mime: self.audio_format().mime,
            audio_chunks_in: self.audio_chunks_in.load(Ordering::Relaxed),
            audio_chunks_out: self.audio_chunks_out.load(Ordering::Relaxed),
            audio_bytes_in: self.audio_bytes_in.load(Ordering::Relaxed),
            resumable: self.resumption_handle.read().is_some(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Serializable view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: String,
    pub phase: &'static str,
    pub created_at: String,
    pub turns: usize,
    pub audio_mime: String,
    pub audio_chunks_in: u64,
    pub audio_chunks_out: u64,
    pub audio_bytes_in: u64,
    pub resumable: bool,
}

/// Manages all live sessions.
///
/// ## Resource Management:
/// - Enforces the maximum number of concurrent sessions
/// - Every `register` is paired with a `remove` in the session runtime's teardown,
///   including error paths, so entries cannot accumulate
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    max_concurrent_sessions: AtomicUsize,
}

impl SessionRegistry {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions: AtomicUsize::new(max_concurrent_sessions),
        }
    }

    /// Add a session. Fails with `Capacity` when the limit is reached.
    pub fn register(&self, session: Arc<Session>) -> AppResult<SessionId> {
        let mut sessions = self.sessions.write();

        let limit = self.max_sessions();
        if sessions.len() >= limit {
            return Err(AppError::Capacity(format!(
                "Maximum concurrent sessions ({}) reached",
                limit
            )));
        }

        let id = session.id;
        if sessions.contains_key(&id) {
            return Err(AppError::Internal(format!("Session '{}' already registered", id)));
        }

        sessions.insert(id, session);
        Ok(id)
    }

    pub fn lookup(&self, id: &SessionId) -> AppResult<Arc<Session>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", id)))
    }

    /// Remove a session. Returns whether it was still registered.
    pub fn remove(&self, id: &SessionId) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_concurrent_sessions.load(Ordering::Relaxed)
    }

    /// Change the limit. Sessions already registered are kept even above it.
    pub fn set_max_sessions(&self, limit: usize) {
        self.max_concurrent_sessions.store(limit, Ordering::Relaxed);
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self.sessions.read().values().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("active", &self.active_count())
            .field("max", &self.max_sessions())
            .finish()
    }
}

//! # Transcript Summarization
//!
//! Turns a session transcript into a structured summary and persists it.
//!
//! ## Coordinator State Machine:
//! `Idle -> Summarizing -> Idle`. The coordinator holds an async mutex for the whole
//! run, so a second `end` waits behind the first instead of running concurrently. If
//! the transcript has not grown while it waited, it gets the first run's outcome and
//! the summarizer is called only once. A saved summary is reused for as long as the
//! transcript is unchanged; a failed run is only shared with callers that were already
//! waiting on it, so a later `end` retries.
//!
//! ## Algorithm:
//! 1. Empty transcript: no-op, nothing is called
//! 2. Volunteered name is saved (best-effort)
//! 3. Prior summary is fetched (best-effort, empty on failure)
//! 4. Strict-JSON request built from the flattened transcript and the schema hint
//! 5. Response recovered with [`extract_json`]
//! 6. Result persisted; persistence failure is a soft failure

pub mod extract;
pub mod gemini;
pub mod prompt;

use crate::backend::{ProfileBackend, SummaryRecord};
use crate::config::FeatureToggles;
use crate::session::Session;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub use extract::extract_json;
pub use gemini::{GeminiSummarizer, GenerationRequest, Summarizer};

/// Result of one summarization request.
#[derive(Debug, Clone, PartialEq)]
pub enum SummaryOutcome {
    /// Nothing to summarize
    NoOp,
    /// Persisted; `location` is a path or `ok`
    Saved { location: String },
    /// Summarizer or backend failed; the session carries on
    SoftFailure { reason: String },
}

impl SummaryOutcome {
    /// The `data` of the `summary_saved` frame.
    pub fn status_token(&self) -> String {
        match self {
            SummaryOutcome::NoOp => "ok".to_string(),
            SummaryOutcome::Saved { location } => location.clone(),
            SummaryOutcome::SoftFailure { reason } => format!("error: {}", reason),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, SummaryOutcome::SoftFailure { .. })
    }
}

/// Per-session summarization coordinator.
pub struct SummaryCoordinator {
    summarizer: Arc<dyn Summarizer>,
    backend: Arc<dyn ProfileBackend>,
    features: FeatureToggles,
    temperature: f32,
    /// Number of completed runs, read before queueing on `last_run`
    completed_runs: AtomicU64,
    /// Transcript length and outcome of the last completed run
    last_run: Mutex<Option<(usize, SummaryOutcome)>>,
}

impl SummaryCoordinator {
    pub fn new(
        summarizer: Arc<dyn Summarizer>,
        backend: Arc<dyn ProfileBackend>,
        features: FeatureToggles,
        temperature: f32,
    ) -> Self {
        Self {
            summarizer,
            backend,
            features,
            temperature,
            completed_runs: AtomicU64::new(0),
            last_run: Mutex::new(None),
        }
    }

    /// Summarize the session's transcript as it stands now. Never fails.
    pub async fn summarize(&self, session: &Session) -> SummaryOutcome {
        let runs_before = self.completed_runs.load(Ordering::Acquire);
        let mut last_run = self.last_run.lock().await;
        let finished_while_waiting = self.completed_runs.load(Ordering::Acquire) > runs_before;

        let turns = session.transcript.snapshot();
        if turns.is_empty() {
            info!("No transcript yet; skipping summary");
            return SummaryOutcome::NoOp;
        }

        if let Some((count, outcome)) = last_run.as_ref() {
            if *count == turns.len() && (!outcome.is_failure() || finished_while_waiting) {
                debug!("Transcript unchanged since last summary; reusing outcome");
                return outcome.clone();
            }
        }

        let outcome = self.run(session, &turns).await;
        *last_run = Some((turns.len(), outcome.clone()));
        self.completed_runs.fetch_add(1, Ordering::Release);
        outcome
    }

    async fn run(&self, session: &Session, turns: &[crate::session::Turn]) -> SummaryOutcome {
        if self.features.name_extraction {
            if let Some(name) = prompt::volunteered_name(turns) {
                match self.backend.save_name(&session.user_id, &name).await {
                    Ok(()) => info!(name = %name, "Saved volunteered name"),
                    Err(err) => error!("Error saving user name: {}", err),
                }
            }
        }

        let previous = match self.backend.get_summary(&session.user_id).await {
            Ok(previous) => previous.unwrap_or_default(),
            Err(err) => {
                warn!("Prior summary unavailable, continuing without it: {}", err);
                String::new()
            }
        };

        let handle = session.resumption_handle();
        let schema = prompt::schema_hint(handle.as_deref(), self.features.wellness_metrics);
        let request = GenerationRequest {
            prompt: prompt::build_summary_prompt(
                &previous,
                &schema,
                &prompt::flatten_transcript(turns),
                self.features.wellness_metrics,
            ),
            system_instruction: Some(prompt::SUMMARY_SYSTEM_NOTE.to_string()),
            temperature: self.temperature,
            json_output: true,
        };

        let text = match self.summarizer.generate(request).await {
            Ok(text) => text,
            Err(err) => {
                error!("Summarization failed: {}", err);
                return SummaryOutcome::SoftFailure { reason: err.to_string() };
            }
        };
        debug!(raw = %text, "Raw summarizer response");

        let record = SummaryRecord {
            user_id: session.user_id.clone(),
            client_id: session.id.to_string(),
            session_handle: handle,
            saved_at: Utc::now(),
            summary: extract_json(&text),
            transcript: turns.to_vec(),
        };

        match self.backend.save_summary(&record).await {
            Ok(location) => {
                info!(location = %location, turns = turns.len(), "Summary saved");
                SummaryOutcome::Saved { location }
            }
            Err(err) => {
                error!("Error persisting summary: {}", err);
                SummaryOutcome::SoftFailure { reason: err.to_string() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::{FakeBackend, FakeSummarizer};
    use crate::session::Role;
    use std::time::Duration;

    fn coordinator(summarizer: Arc<FakeSummarizer>, backend: Arc<FakeBackend>) -> Arc<SummaryCoordinator> {
        Arc::new(SummaryCoordinator::new(
            summarizer,
            backend,
            crate::config::AppConfig::default().features,
            0.3,
        ))
    }

    fn session() -> Arc<Session> {
        Arc::new(Session::new("u1", "audio/pcm;rate=16000"))
    }

    #[tokio::test]
    async fn test_empty_transcript_is_noop() {
        let summarizer = Arc::new(FakeSummarizer::replying("{}"));
        let coordinator = coordinator(summarizer.clone(), Arc::new(FakeBackend::default()));

        let outcome = coordinator.summarize(&session()).await;
        assert_eq!(outcome, SummaryOutcome::NoOp);
        assert_eq!(outcome.status_token(), "ok");
        assert_eq!(summarizer.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_ends_summarize_once() {
        let summarizer = Arc::new(FakeSummarizer::replying(r#"{"summary":"fine"}"#).with_delay(Duration::from_millis(50)));
        let backend = Arc::new(FakeBackend::default());
        let coordinator = coordinator(summarizer.clone(), backend.clone());
        let session = session();
        session.transcript.append(Role::User, "I had a rough week");

        let (first, second) = tokio::join!(coordinator.summarize(&session), coordinator.summarize(&session));

        assert_eq!(first, second);
        assert_eq!(summarizer.calls(), 1);
        assert_eq!(backend.saved_summaries().len(), 1);
        assert_eq!(backend.saved_summaries()[0].summary["summary"], "fine");
    }

    #[tokio::test]
    async fn test_new_turns_trigger_new_summary() {
        let summarizer = Arc::new(FakeSummarizer::replying("not json at all"));
        let backend = Arc::new(FakeBackend::default());
        let coordinator = coordinator(summarizer.clone(), backend.clone());
        let session = session();

        session.transcript.append(Role::User, "hello");
        coordinator.summarize(&session).await;
        session.transcript.append(Role::Assistant, "hi there");
        coordinator.summarize(&session).await;

        assert_eq!(summarizer.calls(), 2);
        let saved = backend.saved_summaries();
        assert_eq!(saved[0].summary, serde_json::json!({ "raw": "not json at all" }));
        assert_eq!(saved[1].transcript.len(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_soft() {
        let session = session();
        session.transcript.append(Role::User, "my name is Sam");

        let failing_save = coordinator(Arc::new(FakeSummarizer::replying("{}")), Arc::new(FakeBackend::failing()));
        let outcome = failing_save.summarize(&session).await;
        assert!(outcome.is_failure());
        assert!(outcome.status_token().starts_with("error: "));

        let backend = Arc::new(FakeBackend::default());
        let failing_model = coordinator(Arc::new(FakeSummarizer::failing()), backend.clone());
        assert!(failing_model.summarize(&session).await.is_failure());
        assert_eq!(backend.saved_names(), vec![("u1".to_string(), "sam".to_string())]);
        assert!(backend.saved_summaries().is_empty());
    }

    #[tokio::test]
    async fn test_failed_summary_is_retried_later() {
        let summarizer = Arc::new(FakeSummarizer::replying(r#"{"summary":"fine"}"#));
        let coordinator = coordinator(summarizer.clone(), Arc::new(FakeBackend::failing()));
        let session = session();
        session.transcript.append(Role::User, "I had a rough week");

        assert!(coordinator.summarize(&session).await.is_failure());
        assert!(coordinator.summarize(&session).await.is_failure());

        assert_eq!(summarizer.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_ends_share_a_failure() {
        let summarizer = Arc::new(FakeSummarizer::replying("{}").with_delay(Duration::from_millis(50)));
        let coordinator = coordinator(summarizer.clone(), Arc::new(FakeBackend::failing()));
        let session = session();
        session.transcript.append(Role::User, "hello");

        let (first, second) = tokio::join!(coordinator.summarize(&session), coordinator.summarize(&session));

        assert!(first.is_failure());
        assert_eq!(first, second);
        assert_eq!(summarizer.calls(), 1);
    }
}

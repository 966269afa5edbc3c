//! # Profile & Summary Backend
//!
//! The store for user profiles and session summaries. The relay never owns that
//! storage; it talks to it through [`ProfileBackend`].
//!
//! ## Implementations:
//! - [`HttpBackend`]: the REST profile service (`/user`, `/get-summary`, `/save-summary`, `/save-name`)
//! - [`ArchiveBackend`]: local JSON files, used when no backend URL is configured

pub mod archive;
pub mod http;

use crate::error::AppResult;
use crate::session::Turn;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub use archive::ArchiveBackend;
pub use http::HttpBackend;

/// What the backend knows about a user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserProfile {
    pub name: Option<String>,
    /// `summary_data` of the most recent saved summary
    pub latest_summary: Option<Value>,
}

impl UserProfile {
    /// Read the profile document shape shared by both backends:
    /// `{"name": ..., "latestSummary": {"summary_data": {...}}}`.
    pub fn from_document(document: &Value) -> Self {
        let latest_summary = document
            .pointer("/latestSummary/summary_data")
            .filter(|v| !v.is_null() && v.as_object().map_or(true, |o| !o.is_empty()))
            .cloned();

        Self {
            name: document.get("name").and_then(Value::as_str).map(str::to_string),
            latest_summary,
        }
    }
}

/// One end-of-session summary ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRecord {
    pub user_id: String,
    /// Relay session id of the connection that produced it
    pub client_id: String,
    /// Live-session resumption handle at the time of the summary, if any
    pub session_handle: Option<String>,
    pub saved_at: DateTime<Utc>,
    pub summary: Value,
    pub transcript: Vec<Turn>,
}

impl SummaryRecord {
    pub fn meta(&self) -> Value {
        serde_json::json!({
            "client_id": self.client_id,
            "session_id": self.session_handle,
            "saved_at_utc": self.saved_at.to_rfc3339(),
        })
    }
}

/// Pull `latestSummary.summary_data.summary` out of a `/get-summary` style document.
pub fn prior_summary_text(document: &Value) -> Option<String> {
    document
        .pointer("/latestSummary/summary_data/summary")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
pub trait ProfileBackend: Send + Sync {
    /// Short label for logs and the metrics endpoint.
    fn kind(&self) -> &'static str;

    /// Profile of a user, `None` when the backend has never seen them.
    async fn get_user(&self, user_id: &str) -> AppResult<Option<UserProfile>>;

    /// Free-text summary of the user's previous session.
    async fn get_summary(&self, user_id: &str) -> AppResult<Option<String>>;

    /// Persist a summary. Returns an output location, or `ok` when the backend has none.
    async fn save_summary(&self, record: &SummaryRecord) -> AppResult<String>;

    async fn save_name(&self, user_id: &str, name: &str) -> AppResult<()>;
}

//! Local JSON archive used when no profile service is configured.
//!
//! ## Layout:
//! - `{root}/{client_id}_{YYYYmmddTHHMMSS.ffffffZ}.json`: one document per summarized session;
//!   a name already taken gets a `-{n}` suffix, so summaries are never overwritten
//! - `{root}/profiles/{user_id}.json`: `{"name", "latestSummary": {"summary_data", "meta"}}`

use super::{prior_summary_text, ProfileBackend, SummaryRecord, UserProfile};
use crate::error::AppResult;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

pub struct ArchiveBackend {
    root: PathBuf,
    /// Serializes profile read-modify-write cycles
    profile_lock: Mutex<()>,
}

impl ArchiveBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            profile_lock: Mutex::new(()),
        }
    }

    fn profile_path(&self, user_id: &str) -> PathBuf {
        self.root.join("profiles").join(format!("{}.json", file_stem(user_id)))
    }

    async fn read_profile(&self, user_id: &str) -> AppResult<Option<Value>> {
        match tokio::fs::read(self.profile_path(user_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn update_profile(&self, user_id: &str, update: impl FnOnce(&mut Map<String, Value>)) -> AppResult<()> {
        let _guard = self.profile_lock.lock().await;

        let mut profile = match self.read_profile(user_id).await? {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        update(&mut profile);

        let path = self.profile_path(user_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(&Value::Object(profile))?).await?;
        Ok(())
    }

    /// Write `bytes` to a file that did not exist before, adding a numeric suffix to
    /// `stem` until the name is free.
    async fn write_new(&self, stem: &str, bytes: &[u8]) -> AppResult<PathBuf> {
        let mut attempt = 0u32;
        loop {
            let path = match attempt {
                0 => self.root.join(format!("{}.json", stem)),
                n => self.root.join(format!("{}-{}.json", stem, n)),
            };
            let opened = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match opened {
                Ok(mut file) => {
                    file.write_all(bytes).await?;
                    file.flush().await?;
                    return Ok(path);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Keep user-supplied ids from escaping the archive directory.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl ProfileBackend for ArchiveBackend {
    fn kind(&self) -> &'static str {
        "archive"
    }

    async fn get_user(&self, user_id: &str) -> AppResult<Option<UserProfile>> {
        Ok(self.read_profile(user_id).await?.as_ref().map(UserProfile::from_document))
    }

    async fn get_summary(&self, user_id: &str) -> AppResult<Option<String>> {
        Ok(self.read_profile(user_id).await?.as_ref().and_then(prior_summary_text))
    }

    async fn save_summary(&self, record: &SummaryRecord) -> AppResult<String> {
        tokio::fs::create_dir_all(&self.root).await?;

        let stem = format!(
            "{}_{}",
            file_stem(&record.client_id),
            record.saved_at.format("%Y%m%dT%H%M%S%.6fZ")
        );
        let document = json!({
            "meta": record.meta(),
            "summary": record.summary,
            "transcript": record.transcript,
        });
        let path = self.write_new(&stem, &serde_json::to_vec_pretty(&document)?).await?;

        let latest = json!({ "summary_data": record.summary, "meta": record.meta() });
        self.update_profile(&record.user_id, |profile| {
            profile.insert("latestSummary".to_string(), latest);
        })
        .await?;

        let location = path.display().to_string();
        info!(user = %record.user_id, path = %location, "Summary archived");
        Ok(location)
    }

    async fn save_name(&self, user_id: &str, name: &str) -> AppResult<()> {
        self.update_profile(user_id, |profile| {
            profile.insert("name".to_string(), Value::String(name.to_string()));
        })
        .await
    }
}

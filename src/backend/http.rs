//! REST profile service client.

use super::{prior_summary_text, ProfileBackend, SummaryRecord, UserProfile};
use crate::config::BackendConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

pub struct HttpBackend {
    client: Client,
    base_url: Url,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, config: &BackendConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let base_url = base_url.into();
        let base_url = Url::parse(&base_url)
            .map_err(|e| AppError::ConfigError(format!("Invalid backend URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::ConfigError(format!("Backend URL {} cannot take a path", base_url)));
        }

        Ok(Self { client, base_url })
    }

    /// Append path segments to the base URL. Each segment is percent-encoded, so an id
    /// containing `/`, `?` or `#` stays a single segment.
    fn url(&self, segments: &[&str]) -> AppResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::ConfigError(format!("Backend URL {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// GET a JSON document; 404 means "nothing stored".
    async fn get_document(&self, segments: &[&str]) -> AppResult<Option<Value>> {
        let url = self.url(segments)?;
        let response = self.client.get(url.clone()).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Backend has no document at {}", url.path());
            return Ok(None);
        }

        let response = response.error_for_status()?;
        Ok(Some(response.json().await?))
    }
}

#[async_trait]
impl ProfileBackend for HttpBackend {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn get_user(&self, user_id: &str) -> AppResult<Option<UserProfile>> {
        let document = self.get_document(&["user", user_id]).await?;
        Ok(document.as_ref().map(UserProfile::from_document))
    }

    async fn get_summary(&self, user_id: &str) -> AppResult<Option<String>> {
        let document = self.get_document(&["get-summary", user_id]).await?;
        Ok(document.as_ref().and_then(prior_summary_text))
    }

    async fn save_summary(&self, record: &SummaryRecord) -> AppResult<String> {
        let payload = json!({
            "uid": record.user_id,
            "summary": {
                "summary_data": record.summary,
                "meta": record.meta(),
            }
        });

        let response = self
            .client
            .post(self.url(&["save-summary"])?)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Collaborator(format!(
                "save-summary returned {}: {}",
                status, body
            )));
        }

        info!(user = %record.user_id, "Summary sent to backend");
        Ok("ok".to_string())
    }

    async fn save_name(&self, user_id: &str, name: &str) -> AppResult<()> {
        self.client
            .post(self.url(&["save-name"])?)
            .json(&json!({ "uid": user_id, "name": name }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

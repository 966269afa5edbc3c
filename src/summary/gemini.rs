//! Text generation through the Gemini REST API (`generateContent`).

use super::prompt::pick_summarizer_model;
use crate::config::SummarizerConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// One text generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_instruction: Option<String>,
    pub temperature: f32,
    /// Ask for `application/json` output
    pub json_output: bool,
}

/// The text model collaborator used for summaries and greeting questions.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Generate text. Returns the concatenated text parts of the response.
    async fn generate(&self, request: GenerationRequest) -> AppResult<String>;
}

pub struct GeminiSummarizer {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl GeminiSummarizer {
    /// `live_model` is used to derive a text model when none is configured.
    pub fn new(config: &SummarizerConfig, live_model: &str) -> AppResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::ConfigError("summarizer.api_key is not set".to_string()))?;

        let model = match &config.model {
            Some(model) if !model.trim().is_empty() => model.clone(),
            _ => {
                let picked = pick_summarizer_model(live_model);
                if picked != live_model {
                    info!("Using summarizer model '{}' (derived from '{}')", picked, live_model);
                }
                picked
            }
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Deserialize, Default)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize, Default)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Deserialize, Default)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Default)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

fn text_part(text: String) -> Part {
    Part { text: Some(text) }
}

fn collect_text(response: GenerateContentResponse) -> String {
    response
        .candidates
        .into_iter()
        .filter_map(|c| c.content)
        .flat_map(|content| content.parts)
        .filter_map(|part| part.text)
        .collect()
}

#[async_trait]
impl Summarizer for GeminiSummarizer {
    async fn generate(&self, request: GenerationRequest) -> AppResult<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.endpoint, self.model, self.api_key
        );

        let body = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![text_part(request.prompt)],
            }],
            system_instruction: request.system_instruction.map(|text| Content {
                role: None,
                parts: vec![text_part(text)],
            }),
            generation_config: GenerationConfig {
                temperature: request.temperature,
                response_mime_type: request.json_output.then_some("application/json"),
            },
        };

        let response = self.client.post(url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Collaborator(format!(
                "generateContent returned {}: {}",
                status, text
            )));
        }

        let parsed: GenerateContentResponse = response.json().await?;
        let text = collect_text(parsed);
        debug!(model = %self.model, chars = text.len(), "Summarizer responded");
        Ok(text)
    }
}

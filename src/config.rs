//! # Configuration Management
//!
//! This module handles loading and managing relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP__ prefix, `__` between section and key)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (HOST, PORT, GEMINI_API_KEY / GOOGLE_API_KEY)
//! 2. Environment variables (APP__SERVER__PORT, APP__FEATURES__DYNAMIC_GREETING, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Why `__` as separator:
//! Several keys contain underscores themselves (`api_key`, `base_url`), so a single `_`
//! would split `APP_UPSTREAM_API_KEY` into the wrong path.

use anyhow::Result;                    // Better error handling with context
use serde::{Deserialize, Serialize};   // For converting to/from TOML, JSON, etc.
use std::env;                          // For reading environment variables
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each collaborator of the relay (live session, summarizer, backend) gets its own
/// group, so a deployment can point each one somewhere else independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub summarizer: SummarizerConfig,
    pub backend: BackendConfig,
    pub session: SessionConfig,
    pub features: FeatureToggles,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// The live streaming AI session the relay talks to.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional streaming service
/// - `api_key`: Appended as `?key=` to the endpoint (never echoed by the API)
/// - `model`: Live model used for the conversation
/// - `voice`: Prebuilt voice for spoken replies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub connect_timeout_secs: u64,
}

/// The text model used for end-of-session summaries and greeting questions.
///
/// `model = None` means "derive a text model from the live model name".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

/// Profile/summary backend. Without a `base_url`, summaries go to the local archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
}

/// Per-connection limits and defaults.
///
/// ## Tuning guidelines:
/// - Larger `audio_queue_capacity`: absorbs upstream hiccups, but more audio in flight
/// - Shorter `handshake_timeout_secs`: idle sockets are dropped sooner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub handshake_timeout_secs: u64,
    pub audio_queue_capacity: usize,
    pub max_concurrent_sessions: usize,
    pub default_audio_mime: String,
    pub summaries_dir: String,
    pub system_instruction_path: String,
}

/// Named toggles for behaviours that only some deployments want.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureToggles {
    /// Personalize the system instruction from the user's last summary
    pub dynamic_greeting: bool,
    /// Save a name volunteered as "my name is ..." to the backend
    pub name_extraction: bool,
    /// Ask the summarizer for mood / energy / stress scoring fields
    pub wellness_metrics: bool,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the relay can start even if no configuration file exists.
/// They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8765,
            },
            upstream: UpstreamConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                api_key: None,
                model: "gemini-live-2.5-flash-preview".to_string(),
                voice: "Puck".to_string(),
                connect_timeout_secs: 15,
            },
            summarizer: SummarizerConfig {
                endpoint: "https://generativelanguage.googleapis.com".to_string(),
                api_key: None,
                model: None,
                temperature: 0.3,
                request_timeout_secs: 60,
            },
            backend: BackendConfig {
                base_url: None,
                request_timeout_secs: 10,
            },
            session: SessionConfig {
                handshake_timeout_secs: 10,
                audio_queue_capacity: 64,
                max_concurrent_sessions: 32,
                default_audio_mime: "audio/pcm;rate=16000".to_string(),
                summaries_dir: "data/summaries".to_string(),
                system_instruction_path: "system_instruction.txt".to_string(),
            },
            features: FeatureToggles {
                dynamic_greeting: false,
                name_extraction: true,
                wellness_metrics: true,
            },
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP__BACKEND__BASE_URL=http://localhost:3000`: Use the HTTP profile backend
    /// - `APP__FEATURES__DYNAMIC_GREETING=true`: Turn on personalized greetings
    /// - `GEMINI_API_KEY=...`: Key for both the live session and the summarizer
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP__ prefix
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        // Deployment platforms commonly set these without any prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // One key usually serves both the live session and the summarizer
        if let Ok(key) = env::var("GEMINI_API_KEY").or_else(|_| env::var("GOOGLE_API_KEY")) {
            settings = settings
                .set_override("upstream.api_key", key.clone())?
                .set_override("summarizer.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Queue capacity, session limit and handshake timeout are positive
    /// - Summarizer temperature lies in `[0, 2]`
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.session.audio_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Audio queue capacity must be greater than 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.session.handshake_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Handshake timeout must be greater than 0"));
        }

        if !(0.0..=2.0).contains(&self.summarizer.temperature) {
            return Err(anyhow::anyhow!(
                "Summarizer temperature must be between 0 and 2, got {}",
                self.summarizer.temperature
            ));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only some fields can change at runtime. Sessions take a snapshot of these
    /// settings when they are accepted, so live sessions are never affected.
    /// For example, `{"features": {"dynamic_greeting": true}}` only flips one toggle.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(session) = partial_config.get("session") {
            if let Some(timeout) = session.get("handshake_timeout_secs").and_then(|v| v.as_u64()) {
                self.session.handshake_timeout_secs = timeout;
            }
            if let Some(capacity) = session.get("audio_queue_capacity").and_then(|v| v.as_u64()) {
                self.session.audio_queue_capacity = capacity as usize;
            }
            if let Some(limit) = session.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.session.max_concurrent_sessions = limit as usize;
            }
            if let Some(mime) = session.get("default_audio_mime").and_then(|v| v.as_str()) {
                self.session.default_audio_mime = mime.to_string();
            }
        }

        if let Some(features) = partial_config.get("features") {
            if let Some(flag) = features.get("dynamic_greeting").and_then(|v| v.as_bool()) {
                self.features.dynamic_greeting = flag;
            }
            if let Some(flag) = features.get("name_extraction").and_then(|v| v.as_bool()) {
                self.features.name_extraction = flag;
            }
            if let Some(flag) = features.get("wellness_metrics").and_then(|v| v.as_bool()) {
                self.features.wellness_metrics = flag;
            }
        }

        if let Some(summarizer) = partial_config.get("summarizer") {
            if let Some(temperature) = summarizer.get("temperature").and_then(|v| v.as_f64()) {
                self.summarizer.temperature = temperature as f32;
            }
        }

        // Validate the updated configuration to ensure it's still valid
        self.validate()?;
        Ok(())
    }
}

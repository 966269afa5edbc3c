//! # Error Handling
//!
//! This module defines the relay's error type and how it is converted to HTTP responses.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **Purpose**: Forces you to handle both success and failure cases
//! - **No exceptions**: Rust doesn't have try/catch, it uses Result instead
//!
//! ### Enums for Error Types
//! - **Variants**: Each enum variant represents a different kind of failure
//! - **Pattern matching**: Use `match` to decide whether a failure is fatal for a session
//!
//! ## Error taxonomy of a relay session:
//! - **Handshake**: the client never identified itself. Fatal, the connection is closed.
//! - **Upstream**: the live AI session failed. Fatal, all session tasks are torn down.
//! - **Transport**: the client could not be written to. Logged, processing continues.
//! - **Collaborator**: the summarizer or the profile backend failed. Degrades to a soft failure.
//!
//! Everything else maps onto HTTP status codes for the small management API.

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Handshake**: The first WebSocket message was missing, late or malformed
/// - **Upstream**: The live AI session could not be opened or broke mid-stream
/// - **Transport**: The client connection is gone or refused a write
/// - **Collaborator**: A summarizer or backend call failed
/// - **Capacity**: The session registry is full (503 errors)
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::Handshake("user_id message expected".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Internal server errors (file system failures, serialization bugs, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Identification handshake violated (absent, malformed or timed out)
    Handshake(String),

    /// Live AI session failure
    Upstream(String),

    /// Client transport failure
    Transport(String),

    /// Summarizer or profile backend failure
    Collaborator(String),

    /// Too many concurrent sessions
    Capacity(String),
}

impl AppError {
    /// Whether this error ends the session it occurred in.
    ///
    /// Only handshake violations and upstream failures close a session; every other
    /// kind is absorbed where it happens and surfaces as a log entry or a soft failure.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(self, AppError::Handshake(_) | AppError::Upstream(_))
    }
}

/// Implementation of the Display trait for AppError.
///
/// ## Purpose:
/// This trait defines how errors are formatted as human-readable strings.
/// It's used in log lines and in the `error: ...` status sent back to clients.
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Handshake(msg) => write!(f, "Handshake error: {}", msg),
            AppError::Upstream(msg) => write!(f, "Upstream session error: {}", msg),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::Collaborator(msg) => write!(f, "Collaborator error: {}", msg),
            AppError::Capacity(msg) => write!(f, "Capacity error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Implementation of the ResponseError trait for AppError.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError/Upstream/Transport → 500
/// - BadRequest/ValidationError/Handshake → 400
/// - NotFound → 404
/// - Collaborator → 502
/// - Capacity → 503
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Session 'abc' not found",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        // Map each error type to HTTP status code, error type, and message
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            AppError::Handshake(msg) => (StatusCode::BAD_REQUEST, "handshake_error", msg.clone()),
            AppError::Upstream(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "upstream_error", msg.clone()),
            AppError::Transport(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "transport_error", msg.clone()),
            AppError::Collaborator(msg) => (StatusCode::BAD_GATEWAY, "collaborator_error", msg.clone()),
            AppError::Capacity(msg) => (StatusCode::SERVICE_UNAVAILABLE, "capacity_error", msg.clone()),
        };

        // Build the HTTP response with JSON body
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,           // Machine-readable error type
                "message": message,           // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()  // When the error occurred
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
///
/// When you use `?` with an anyhow::Error, it automatically becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Automatic conversion from JSON errors to AppError.
///
/// JSON parsing errors are almost always due to a peer sending malformed data,
/// so they map to BadRequest rather than Internal.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Automatic conversion from configuration errors to AppError.
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// HTTP calls only go to the summarizer and the profile backend.
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Collaborator(err.to_string())
    }
}

/// WebSocket client errors only come from the upstream live session.
impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Upstream(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(format!("I/O error: {}", err))
    }
}

/// Type alias for Results that use our custom error type.
///
/// ## Usage Example:
/// ```rust,ignore
/// fn lookup(&self, id: &SessionId) -> AppResult<Arc<Session>> { ... }
/// ```
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_handshake_and_upstream_are_fatal() {
        assert!(AppError::Handshake("late".into()).is_fatal_for_session());
        assert!(AppError::Upstream("closed".into()).is_fatal_for_session());
        assert!(!AppError::Transport("gone".into()).is_fatal_for_session());
        assert!(!AppError::Collaborator("502".into()).is_fatal_for_session());
        assert!(!AppError::BadRequest("json".into()).is_fatal_for_session());
    }

    #[test]
    fn test_error_status_codes() {
        let response = AppError::NotFound("session".into()).error_response();
        assert_eq!(response.status(), actix_web::http::StatusCode::NOT_FOUND);

        let response = AppError::Capacity("full".into()).error_response();
        assert_eq!(response.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);
    }
}

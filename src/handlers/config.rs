use crate::config::AppConfig;
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Configuration view returned by the API. API keys are reported as present or not.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "upstream": {
            "endpoint": config.upstream.endpoint,
            "model": config.upstream.model,
            "voice": config.upstream.voice,
            "connect_timeout_secs": config.upstream.connect_timeout_secs,
            "api_key_configured": config.upstream.api_key.is_some()
        },
        "summarizer": {
            "endpoint": config.summarizer.endpoint,
            "model": config.summarizer.model,
            "temperature": config.summarizer.temperature,
            "request_timeout_secs": config.summarizer.request_timeout_secs,
            "api_key_configured": config.summarizer.api_key.is_some()
        },
        "backend": {
            "base_url": config.backend.base_url,
            "request_timeout_secs": config.backend.request_timeout_secs
        },
        "session": config.session,
        "features": config.features
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Apply a partial update. Sessions already running keep the settings they started with.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}

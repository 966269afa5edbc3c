use crate::session::SessionId;
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// List live sessions, oldest first.
pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let registry = &state.relay.registry;
    let sessions = registry.summaries();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active": sessions.len(),
        "max_sessions": registry.max_sessions(),
        "sessions": sessions
    })))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id: SessionId = path.into_inner().parse()?;
    let session = state.relay.registry.lookup(&id)?;

    Ok(HttpResponse::Ok().json(session.summary()))
}

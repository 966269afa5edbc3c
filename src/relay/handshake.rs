//! Connection handshake: the first frame identifies the user.

use crate::error::{AppError, AppResult};
use crate::protocol::{parse_client_message, ClientMessage, InboundFrame};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Identity supplied by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub user_id: String,
    /// Resumption handle of an earlier live session
    pub resume: Option<String>,
}

const EXPECTED: &str = "user_id message expected";
const TIMEOUT: &str = "user_id timeout";

/// Wait for the `user_id` frame. Anything else, including silence past `timeout`, is a
/// handshake violation; there is no retry.
pub async fn await_handshake(
    inbound: &mut mpsc::Receiver<InboundFrame>,
    timeout: Duration,
) -> AppResult<Handshake> {
    let frame = match tokio::time::timeout(timeout, inbound.recv()).await {
        Err(_) => return Err(AppError::Handshake(TIMEOUT.to_string())),
        Ok(None) => {
            return Err(AppError::Handshake(format!("{} (client left)", EXPECTED)));
        }
        Ok(Some(frame)) => frame,
    };

    let InboundFrame::Text(text) = frame else {
        return Err(AppError::Handshake(format!("{} (got binary frame)", EXPECTED)));
    };

    match parse_client_message(&text) {
        Ok(ClientMessage::UserId { data, resume }) if !data.trim().is_empty() => {
            info!(user = %data.trim(), "Received user ID");
            Ok(Handshake {
                user_id: data.trim().to_string(),
                resume: resume.filter(|h| !h.trim().is_empty()),
            })
        }
        Ok(ClientMessage::UserId { .. }) => Err(AppError::Handshake(format!("{} (empty id)", EXPECTED))),
        _ => Err(AppError::Handshake(EXPECTED.to_string())),
    }
}

/// Close reason sent to the client for a rejected handshake.
pub fn close_reason(err: &AppError) -> String {
    match err {
        AppError::Handshake(message) if message == TIMEOUT => TIMEOUT.to_string(),
        _ => EXPECTED.to_string(),
    }
}

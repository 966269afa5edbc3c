//! # Client Wire Protocol
//!
//! Message types exchanged with the browser over the `/ws` WebSocket.
//!
//! ## Message Format:
//! - **Client → Server**: binary frames carry raw audio; text frames carry JSON
//!   control messages tagged by `type`
//! - **Server → Client**: JSON frames tagged by `type`
//!
//! | Inbound `type`            | Payload            |
//! |---------------------------|--------------------|
//! | `user_id`                 | identity string    |
//! | `client_settings`         | `{transport, mime}`|
//! | `audio` / `audio_base64`  | base64 bytes       |
//! | `text`                    | string             |
//! | `end`                     | (none)             |
//! | `ping`                    | (none)             |

use serde::{Deserialize, Serialize};

/// A raw frame as read from the client transport, before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Binary(Vec<u8>),
    Text(String),
}

/// Audio transport preferences carried by `client_settings`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TransportSettings {
    /// "auto" | "binary" | "base64"; unknown values are ignored
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
}

/// Control messages a client may send as JSON text frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Identification handshake. `resume` optionally continues an earlier live session.
    UserId {
        data: String,
        #[serde(default)]
        resume: Option<String>,
    },

    /// Update audio format and transport preferences for audio queued from now on
    ClientSettings {
        #[serde(default)]
        transport: Option<TransportSettings>,
        #[serde(default)]
        mime: Option<String>,
    },

    /// Base64 encoded audio, an alternative to binary frames
    #[serde(alias = "audio_base64")]
    Audio {
        #[serde(default)]
        data: String,
    },

    /// Typed text from the user
    Text {
        #[serde(default)]
        data: String,
    },

    /// Ask for the end-of-session summary
    End,

    /// Application-level keepalive
    Ping,
}

impl ClientMessage {
    /// The mime type requested by a settings message, wherever the client put it.
    pub fn requested_mime(transport: &Option<TransportSettings>, mime: &Option<String>) -> Option<String> {
        transport
            .as_ref()
            .and_then(|t| t.mime.clone())
            .or_else(|| mime.clone())
            .filter(|m| !m.trim().is_empty())
    }
}

/// Why a text frame could not be turned into a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParseFailure {
    /// Not JSON at all
    Malformed(String),
    /// Valid JSON, but not a message we know (carries the `type` if present)
    Unrecognized(Option<String>),
}

/// Classify a text frame.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ParseFailure> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ParseFailure::Malformed(e.to_string()))?;

    let kind = value.get("type").and_then(|t| t.as_str()).map(str::to_string);
    serde_json::from_value(value).map_err(|_| ParseFailure::Unrecognized(kind))
}

/// Frames the relay sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Connection accepted, waiting for `user_id`
    Ready,
    /// New resumption handle from the live session
    SessionId { data: String },
    /// The model's reply was cut off by user speech
    Interrupted { data: String },
    /// Base64 audio from the model
    Audio { data: String, mime: String },
    /// The model finished its turn
    TurnComplete,
    /// Transcript of what the model said
    Text { data: String },
    /// Result of an `end` request: a location, `ok`, or `error: ...`
    SummarySaved { data: String },
    Pong,
}

impl ServerFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Ready => "ready",
            ServerFrame::SessionId { .. } => "session_id",
            ServerFrame::Interrupted { .. } => "interrupted",
            ServerFrame::Audio { .. } => "audio",
            ServerFrame::TurnComplete => "turn_complete",
            ServerFrame::Text { .. } => "text",
            ServerFrame::SummarySaved { .. } => "summary_saved",
            ServerFrame::Pong => "pong",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Close statuses the relay uses when it ends a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    /// Session ended normally
    Normal,
    /// Handshake violated (WebSocket 1008)
    PolicyViolation,
    /// Live session failed (WebSocket 1011)
    Error,
    /// Registry full (WebSocket 1013)
    TryAgainLater,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_messages() {
        assert_eq!(
            parse_client_message(r#"{"type":"user_id","data":"u1"}"#),
            Ok(ClientMessage::UserId { data: "u1".into(), resume: None })
        );
        assert_eq!(parse_client_message(r#"{"type":"end"}"#), Ok(ClientMessage::End));
        assert_eq!(parse_client_message(r#"{"type":"ping","ts":1}"#), Ok(ClientMessage::Ping));
        assert_eq!(
            parse_client_message(r#"{"type":"audio_base64","data":"AAE="}"#),
            Ok(ClientMessage::Audio { data: "AAE=".into() })
        );
    }

    #[test]
    fn test_parse_settings_mime_locations() {
        let nested = parse_client_message(
            r#"{"type":"client_settings","transport":{"audio":"binary","mime":"audio/webm;codecs=opus"}}"#,
        )
        .unwrap();
        let flat = parse_client_message(r#"{"type":"client_settings","mime":"audio/ogg"}"#).unwrap();

        match nested {
            ClientMessage::ClientSettings { transport, mime } => {
                assert_eq!(
                    ClientMessage::requested_mime(&transport, &mime).as_deref(),
                    Some("audio/webm;codecs=opus")
                );
                assert_eq!(transport.unwrap().audio.as_deref(), Some("binary"));
            }
            other => panic!("unexpected message {:?}", other),
        }
        match flat {
            ClientMessage::ClientSettings { transport, mime } => {
                assert_eq!(ClientMessage::requested_mime(&transport, &mime).as_deref(), Some("audio/ogg"));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_parse_failures() {
        assert!(matches!(parse_client_message("{not json"), Err(ParseFailure::Malformed(_))));
        assert_eq!(
            parse_client_message(r#"{"type":"dance"}"#),
            Err(ParseFailure::Unrecognized(Some("dance".into())))
        );
        assert_eq!(parse_client_message(r#"[1,2]"#), Err(ParseFailure::Unrecognized(None)));
    }

    #[test]
    fn test_server_frame_shapes() {
        assert_eq!(ServerFrame::Ready.to_json().unwrap(), r#"{"type":"ready"}"#);
        assert_eq!(ServerFrame::Pong.to_json().unwrap(), r#"{"type":"pong"}"#);

        let audio = ServerFrame::Audio { data: "AAA=".into(), mime: "audio/pcm;rate=24000".into() };
        let value: serde_json::Value = serde_json::from_str(&audio.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "audio");
        assert_eq!(value["mime"], "audio/pcm;rate=24000");

        let saved = ServerFrame::SummarySaved { data: "ok".into() };
        assert_eq!(saved.to_json().unwrap(), r#"{"type":"summary_saved","data":"ok"}"#);
        assert_eq!(saved.kind(), "summary_saved");
    }
}

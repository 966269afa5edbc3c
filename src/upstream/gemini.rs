//! Gemini Live (BidiGenerateContent) over a WebSocket client connection.
//!
//! ## Wire protocol:
//! 1. Connect to the endpoint with `?key=`
//! 2. Send `{"setup": {...}}` and wait for `{"setupComplete": {}}`
//! 3. Send `realtimeInput.audio` chunks and `clientContent` text turns
//! 4. Receive `serverContent`, `sessionResumptionUpdate` and `goAway` messages
//!
//! One server message can carry several events (an interruption and a transcript,
//! say). They are queued and handed out one at a time, in the order listed in
//! [`events_from_message`].

use super::{LiveConnector, LiveEvents, LiveSender, LiveSession, LiveSetup, UpstreamEvent};
use crate::config::UpstreamConfig;
use crate::error::{AppError, AppResult};
use crate::session::AudioChunk;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector for the Gemini Live API.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    config: UpstreamConfig,
}

impl GeminiLiveConnector {
    pub fn new(config: UpstreamConfig) -> Self {
        Self { config }
    }

    fn url(&self) -> AppResult<String> {
        let key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::ConfigError("upstream.api_key is not set".to_string()))?;
        Ok(format!("{}?key={}", self.config.endpoint, key))
    }
}

/// Build the `setup` message for a session.
pub fn setup_message(setup: &LiveSetup) -> Value {
    let model = if setup.model.starts_with("models/") {
        setup.model.clone()
    } else {
        format!("models/{}", setup.model)
    };

    let mut resumption = json!({});
    if let Some(handle) = &setup.resumption_handle {
        resumption["handle"] = json!(handle);
    }

    json!({
        "setup": {
            "model": model,
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": setup.voice }
                    }
                }
            },
            "systemInstruction": { "parts": [{ "text": setup.system_instruction }] },
            "inputAudioTranscription": {},
            "outputAudioTranscription": {},
            "sessionResumption": resumption
        }
    })
}

/// Translate one server message into events, in a fixed order:
/// resumption, go-away, interruption, model audio, turn complete,
/// output transcript, input transcript.
pub fn events_from_message(message: &Value) -> Vec<UpstreamEvent> {
    let mut events = Vec::new();

    if let Some(update) = message.get("sessionResumptionUpdate") {
        let resumable = update.get("resumable").and_then(Value::as_bool).unwrap_or(false);
        let handle = update.get("newHandle").and_then(Value::as_str).unwrap_or_default();
        if resumable && !handle.is_empty() {
            events.push(UpstreamEvent::ResumptionUpdate { handle: handle.to_string() });
        }
    }

    if let Some(go_away) = message.get("goAway") {
        events.push(UpstreamEvent::GoAway {
            time_left: go_away.get("timeLeft").and_then(Value::as_str).map(str::to_string),
        });
    }

    let Some(content) = message.get("serverContent") else {
        return events;
    };

    if content.get("interrupted").and_then(Value::as_bool).unwrap_or(false) {
        events.push(UpstreamEvent::Interrupted);
    }

    let parts = content
        .pointer("/modelTurn/parts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for part in parts {
        let Some(inline) = part.get("inlineData") else { continue };
        let encoded = inline.get("data").and_then(Value::as_str).unwrap_or_default();
        match BASE64.decode(encoded) {
            Ok(data) if !data.is_empty() => events.push(UpstreamEvent::ModelTurnAudio {
                data,
                mime: inline.get("mimeType").and_then(Value::as_str).map(str::to_string),
            }),
            Ok(_) => {}
            Err(err) => warn!("Dropping undecodable model audio part: {}", err),
        }
    }

    if content.get("turnComplete").and_then(Value::as_bool).unwrap_or(false) {
        events.push(UpstreamEvent::TurnComplete);
    }

    if let Some(text) = content.pointer("/outputTranscription/text").and_then(Value::as_str) {
        if !text.is_empty() {
            events.push(UpstreamEvent::OutputTranscript { text: text.to_string() });
        }
    }

    if let Some(text) = content.pointer("/inputTranscription/text").and_then(Value::as_str) {
        if !text.is_empty() {
            events.push(UpstreamEvent::InputTranscript { text: text.to_string() });
        }
    }

    events
}

/// The service sends JSON in both text and binary frames.
fn message_json(message: Message) -> Option<AppResult<Value>> {
    let parsed = match message {
        Message::Text(text) => serde_json::from_str(&text),
        Message::Binary(bytes) => serde_json::from_slice(&bytes),
        Message::Close(frame) => {
            let reason = frame
                .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                .unwrap_or_else(|| "no reason".to_string());
            return Some(Err(AppError::Upstream(format!("live session closed: {}", reason))));
        }
        _ => return None,
    };
    Some(parsed.map_err(|e| AppError::BadRequest(format!("unparseable server message: {}", e))))
}

async fn await_setup_complete(stream: &mut SplitStream<WsStream>) -> AppResult<()> {
    while let Some(message) = stream.next().await {
        match message_json(message?) {
            Some(Ok(value)) if value.get("setupComplete").is_some() => return Ok(()),
            Some(Ok(value)) => debug!("Ignoring pre-setup message: {}", value),
            Some(Err(err)) if err.is_fatal_for_session() => return Err(err),
            Some(Err(err)) => debug!("Ignoring pre-setup message: {}", err),
            None => {}
        }
    }
    Err(AppError::Upstream("connection closed before setup completed".to_string()))
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(&self, setup: LiveSetup) -> AppResult<LiveSession> {
        let url = self.url()?;
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);

        let handshake = async {
            let (socket, _response) = connect_async(url.as_str()).await?;
            let (mut sink, mut stream) = socket.split();

            sink.send(Message::Text(setup_message(&setup).to_string())).await?;
            await_setup_complete(&mut stream).await?;
            Ok::<_, AppError>((sink, stream))
        };

        let (sink, stream) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| AppError::Upstream(format!("live session setup timed out after {:?}", timeout)))??;

        info!(model = %setup.model, resumed = setup.resumption_handle.is_some(), "Live session opened");

        Ok(LiveSession {
            sender: Arc::new(GeminiSender { sink: Mutex::new(sink) }),
            events: Box::new(GeminiEvents { stream, pending: VecDeque::new() }),
        })
    }
}

struct GeminiSender {
    sink: Mutex<SplitSink<WsStream, Message>>,
}

impl GeminiSender {
    async fn send_json(&self, value: Value) -> AppResult<()> {
        self.sink.lock().await.send(Message::Text(value.to_string())).await?;
        Ok(())
    }
}

#[async_trait]
impl LiveSender for GeminiSender {
    async fn send_audio(&self, chunk: &AudioChunk) -> AppResult<()> {
        self.send_json(json!({
            "realtimeInput": {
                "audio": { "data": BASE64.encode(&chunk.data), "mimeType": chunk.mime }
            }
        }))
        .await
    }

    async fn send_text(&self, text: &str) -> AppResult<()> {
        self.send_json(json!({
            "clientContent": {
                "turns": [{ "role": "user", "parts": [{ "text": text }] }],
                "turnComplete": true
            }
        }))
        .await
    }

    async fn close(&self) -> AppResult<()> {
        self.sink.lock().await.close().await?;
        Ok(())
    }
}

struct GeminiEvents {
    stream: SplitStream<WsStream>,
    pending: VecDeque<UpstreamEvent>,
}

#[async_trait]
impl LiveEvents for GeminiEvents {
    async fn next_event(&mut self) -> Option<AppResult<UpstreamEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }

            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(err.into())),
            };

            if let Message::Close(Some(frame)) = &message {
                if frame.code == CloseCode::Normal {
                    info!("Live session closed by the service");
                    return None;
                }
            }

            match message_json(message) {
                Some(Ok(value)) => self.pending.extend(events_from_message(&value)),
                Some(Err(err)) => return Some(Err(err)),
                None => {}
            }
        }
    }
}

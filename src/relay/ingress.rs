//! Ingress reader: classifies client frames after the handshake.
//!
//! | Frame                     | Effect                                          |
//! |---------------------------|-------------------------------------------------|
//! | binary                    | enqueue audio (waits when the queue is full)     |
//! | `client_settings`         | update format for audio enqueued from now on    |
//! | `audio` / `audio_base64`  | decode and enqueue; bad base64 is dropped       |
//! | `text`                    | user turn, forwarded to the live session        |
//! | `end`                     | summarize, reply with one `summary_saved` frame |
//! | `ping`                    | `pong`                                          |
//! | anything else             | logged and ignored                              |

use super::{forward, ClientSink, RelayCounters, TaskExit};
use crate::protocol::{
    parse_client_message, ClientMessage, InboundFrame, ParseFailure, ServerFrame, TransportSettings,
};
use crate::session::{AudioChunk, AudioProducer, AudioTransport, Role, Session};
use crate::summary::SummaryCoordinator;
use crate::upstream::UpstreamLink;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) struct Ingress {
    pub session: Arc<Session>,
    pub producer: AudioProducer,
    pub link: Arc<UpstreamLink>,
    pub sink: Arc<dyn ClientSink>,
    pub coordinator: Arc<SummaryCoordinator>,
    pub counters: Arc<RelayCounters>,
}

impl Ingress {
    /// Read frames until the client goes away.
    pub async fn run(self, mut inbound: mpsc::Receiver<InboundFrame>) -> TaskExit {
        while let Some(frame) = inbound.recv().await {
            let accepted = match frame {
                InboundFrame::Binary(data) => self.enqueue(data, AudioTransport::Binary).await,
                InboundFrame::Text(text) => self.handle_text(&text).await,
            };
            if !accepted {
                return TaskExit::QueueClosed;
            }
        }
        TaskExit::ClientClosed
    }

    /// Returns `false` only when the audio queue has been closed.
    async fn handle_text(&self, text: &str) -> bool {
        let message = match parse_client_message(text) {
            Ok(message) => message,
            Err(ParseFailure::Malformed(err)) => {
                warn!("Invalid JSON message received: {}", err);
                return true;
            }
            Err(ParseFailure::Unrecognized(kind)) => {
                warn!(kind = kind.as_deref().unwrap_or("<none>"), "Ignoring unrecognized message");
                return true;
            }
        };

        match message {
            ClientMessage::ClientSettings { transport, mime } => {
                self.apply_settings(transport, mime);
                true
            }
            ClientMessage::Audio { data } => match BASE64.decode(data.trim()) {
                Ok(bytes) => self.enqueue(bytes, AudioTransport::Base64).await,
                Err(err) => {
                    warn!("Dropping undecodable base64 audio: {}", err);
                    true
                }
            },
            ClientMessage::Text { data } => {
                self.handle_user_text(&data).await;
                true
            }
            ClientMessage::End => {
                self.summarize().await;
                true
            }
            ClientMessage::Ping => {
                forward(self.sink.as_ref(), ServerFrame::Pong);
                true
            }
            ClientMessage::UserId { .. } => {
                warn!("Received subsequent user_id message; ignoring");
                true
            }
        }
    }

    fn apply_settings(&self, transport: Option<TransportSettings>, mime: Option<String>) {
        let requested_mime = ClientMessage::requested_mime(&transport, &mime);
        let requested_transport = transport.as_ref().and_then(|t| t.audio.as_deref());

        let format = self.session.update_audio_format(|format| {
            if let Some(mime) = &requested_mime {
                format.mime = mime.trim().to_string();
            }
            match requested_transport.map(|t| (t, AudioTransport::parse(t))) {
                Some((_, Some(preference))) => format.transport = preference,
                Some((unknown, None)) => warn!("Ignoring unknown audio transport '{}'", unknown),
                None => {}
            }
        });

        info!(mime = %format.mime, transport = ?format.transport, "Client audio settings updated");
    }

    async fn enqueue(&self, data: Vec<u8>, arrived_as: AudioTransport) -> bool {
        if data.is_empty() {
            debug!("Ignoring empty audio chunk");
            return true;
        }

        let format = self.session.audio_format();
        if format.transport != AudioTransport::Auto && format.transport != arrived_as {
            debug!(preferred = ?format.transport, arrived = ?arrived_as, "Audio arrived on the non-preferred path");
        }
        if format.is_pcm() && data.len() % 2 != 0 {
            warn!(bytes = data.len(), "PCM chunk has odd length; forwarding as is");
        }

        self.session.record_audio_in(data.len());
        if self.producer.available() == 0 {
            debug!("Audio queue full; waiting for the live session");
        }
        self.producer
            .push(AudioChunk {
                data,
                mime: format.mime,
            })
            .await
    }

    async fn handle_user_text(&self, text: &str) {
        if self.session.transcript.append(Role::User, text).is_none() {
            debug!("Ignoring empty text message");
            return;
        }
        info!(chars = text.len(), "Received text");

        if !self.link.accepts_text() {
            debug!("Live session takes no text input; recorded only");
            return;
        }
        if let Err(err) = self.link.send_text(text.trim()).await {
            warn!("Error forwarding text upstream: {}", err);
        }
    }

    async fn summarize(&self) {
        info!("Received end signal from client");
        let outcome = self.coordinator.summarize(&self.session).await;
        self.counters.record_summary(outcome.is_failure());
        forward(
            self.sink.as_ref(),
            ServerFrame::SummarySaved {
                data: outcome.status_token(),
            },
        );
    }
}

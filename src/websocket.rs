//! # Client WebSocket Transport
//!
//! Browser clients connect to `/ws`. Each connection is one [`ClientSocket`] actor that
//! owns nothing but the socket: frames are handed to the session relay through a
//! bounded channel, and the relay writes back through an [`ActorSink`].
//!
//! ## Backpressure:
//! Inbound frames go into the channel with `try_send`. Only when the channel is full
//! does the actor fall back to `ctx.wait`, which suspends stream handling until the
//! relay accepts the frame, so a slow live session slows down reading from the socket
//! instead of buffering without bound.
//!
//! `ctx.wait` also holds back the actor's mailbox: outbound frames, close requests and
//! the heartbeat queue up behind the paused push. A push still waiting after
//! [`STALL_LIMIT`] closes the connection with `1013`, and the heartbeat clock restarts
//! once a paused push completes so the pause is not counted against the client.
//!
//! ## Message Format:
//! - **Client → Server**: binary audio frames, JSON control messages (see `protocol`)
//! - **Server → Client**: JSON frames tagged by `type`

use crate::error::{AppError, AppResult};
use crate::protocol::{CloseStatus, InboundFrame, ServerFrame};
use crate::relay::{run_session, ClientSink, RelayServices, RelaySettings};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Frames buffered between the socket and the ingress reader.
const INBOUND_CAPACITY: usize = 32;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
/// Longest the socket stays paused waiting for the relay to take a frame.
const STALL_LIMIT: Duration = Duration::from_secs(20);

/// How a paused push ended.
#[derive(Debug, PartialEq)]
enum Delivery {
    Accepted,
    RelayGone,
    Stalled,
}

async fn deliver(tx: mpsc::Sender<InboundFrame>, frame: InboundFrame, limit: Duration) -> Delivery {
    match tokio::time::timeout(limit, tx.send(frame)).await {
        Ok(Ok(())) => Delivery::Accepted,
        Ok(Err(_)) => Delivery::RelayGone,
        Err(_) => Delivery::Stalled,
    }
}

/// WebSocket actor for one client connection.
pub struct ClientSocket {
    /// Sending half of the relay's inbound channel; dropped when the socket stops
    inbound: Option<mpsc::Sender<InboundFrame>>,

    /// Relay inputs, consumed when the actor starts
    pending: Option<(mpsc::Receiver<InboundFrame>, Arc<RelayServices>, RelaySettings)>,

    /// Last sign of life from the client
    last_heartbeat: Instant,
}

impl ClientSocket {
    pub fn new(services: Arc<RelayServices>, settings: RelaySettings) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        Self {
            inbound: Some(tx),
            pending: Some((rx, services, settings)),
            last_heartbeat: Instant::now(),
        }
    }

    /// Hand a frame to the relay, pausing the stream while the channel is full.
    fn push(&mut self, frame: InboundFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(tx) = self.inbound.clone() else {
            return;
        };

        let frame = match tx.try_send(frame) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Session relay is gone; stopping socket");
                ctx.stop();
                return;
            }
            Err(mpsc::error::TrySendError::Full(frame)) => frame,
        };

        debug!("Relay is behind; pausing socket reads");
        ctx.wait(
            deliver(tx, frame, STALL_LIMIT)
                .into_actor(self)
                .map(|delivery, act, ctx| match delivery {
                    Delivery::Accepted => act.last_heartbeat = Instant::now(),
                    Delivery::RelayGone => {
                        debug!("Session relay is gone; stopping socket");
                        ctx.stop();
                    }
                    Delivery::Stalled => {
                        warn!(limit_secs = STALL_LIMIT.as_secs(), "Relay stopped taking frames; closing socket");
                        ctx.close(Some(ws::CloseReason {
                            code: close_code(CloseStatus::TryAgainLater),
                            description: Some("relay stalled".to_string()),
                        }));
                        ctx.stop();
                    }
                }),
        );
    }
}

/// Message for sending a serialized frame to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct SendFrame(String);

/// Message asking the actor to close the connection.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseConnection {
    status: CloseStatus,
    reason: String,
}

fn close_code(status: CloseStatus) -> ws::CloseCode {
    match status {
        CloseStatus::Normal => ws::CloseCode::Normal,
        CloseStatus::PolicyViolation => ws::CloseCode::Policy,
        CloseStatus::Error => ws::CloseCode::Error,
        CloseStatus::TryAgainLater => ws::CloseCode::Again,
    }
}

impl Actor for ClientSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket connection started");

        if let Some((rx, services, settings)) = self.pending.take() {
            let sink = Arc::new(ActorSink { addr: ctx.address() });
            tokio::spawn(run_session(rx, sink, services, settings));
        }

        // Protocol-level heartbeat
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Called when the WebSocket connection stops.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("WebSocket connection stopped");
        // Closing the channel ends the ingress reader, which tears the session down
        self.inbound.take();
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.push(InboundFrame::Text(text.to_string()), ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.push(InboundFrame::Binary(data.to_vec()), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed by client: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Handle SendFrame messages.
impl Handler<SendFrame> for ClientSocket {
    type Result = ();

    fn handle(&mut self, msg: SendFrame, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// Handle CloseConnection messages.
impl Handler<CloseConnection> for ClientSocket {
    type Result = ();

    fn handle(&mut self, msg: CloseConnection, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseReason {
            code: close_code(msg.status),
            description: Some(msg.reason),
        }));
        ctx.stop();
    }
}

/// [`ClientSink`] backed by the connection's actor address.
pub struct ActorSink {
    addr: Addr<ClientSocket>,
}

impl ClientSink for ActorSink {
    fn send(&self, frame: ServerFrame) -> AppResult<()> {
        if !self.addr.connected() {
            return Err(AppError::Transport("client connection closed".to_string()));
        }
        let json = frame
            .to_json()
            .map_err(|e| AppError::Internal(format!("Failed to serialize {} frame: {}", frame.kind(), e)))?;
        self.addr.do_send(SendFrame(json));
        Ok(())
    }

    fn close(&self, status: CloseStatus, reason: &str) {
        if self.addr.connected() {
            self.addr.do_send(CloseConnection {
                status,
                reason: reason.to_string(),
            });
        }
    }
}

/// WebSocket endpoint for client sessions.
///
/// Settings are captured from the current configuration, so runtime config updates
/// apply to connections accepted afterwards.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let settings = RelaySettings::from_config(&app_state.get_config());
    let socket = ClientSocket::new(app_state.relay.clone(), settings);

    ws::start(socket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        assert_eq!(u16::from(close_code(CloseStatus::Normal)), 1000);
        assert_eq!(u16::from(close_code(CloseStatus::PolicyViolation)), 1008);
        assert_eq!(u16::from(close_code(CloseStatus::Error)), 1011);
        assert_eq!(u16::from(close_code(CloseStatus::TryAgainLater)), 1013);
    }

    #[tokio::test]
    async fn test_delivery_outcomes() {
        let (tx, mut rx) = mpsc::channel(1);
        let limit = Duration::from_millis(50);

        assert_eq!(deliver(tx.clone(), InboundFrame::Binary(vec![1]), limit).await, Delivery::Accepted);
        // Channel is full and nobody reads it
        assert_eq!(deliver(tx.clone(), InboundFrame::Binary(vec![2]), limit).await, Delivery::Stalled);

        assert_eq!(rx.recv().await, Some(InboundFrame::Binary(vec![1])));
        drop(rx);
        assert_eq!(deliver(tx, InboundFrame::Binary(vec![3]), limit).await, Delivery::RelayGone);
    }
}

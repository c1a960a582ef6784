//! # Conversation WebSocket Handler
//!
//! Clients connect to `/ws/{client_id}` and exchange frames with their conversation
//! pipeline.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the path segment becomes the connection's client id
//! 2. **Messages**: `{"type": "message", "text": "..."}` submits user input
//! 3. **Ready signal**: `{"type": "ready_for_next"}` after the client played the audio
//! 4. **Replies**: one binary frame (MP3) per message, text frames for notices/errors
//! 5. **Disconnect**: the client id is unregistered and the pipeline is dropped
//!
//! ## Actor Model:
//! Each connection is an actix actor. The actor only decodes frames and pushes the
//! resulting signals into an mpsc channel; a separate task owns the
//! `ConversationPipeline` and consumes them one at a time. Outbound frames travel back
//! through the `ConnectionRegistry` as `Outbound` messages to the actor's mailbox,
//! which keeps them in send order.

use crate::conversation::{parse_frame, ConversationPipeline, Signal};
use crate::error::RelayError;
use crate::registry::Channel;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// WebSocket actor for one conversation connection.
pub struct ConversationSocket {
    client_id: String,

    state: AppState,

    /// Inbound signals for the pipeline worker
    signals: Option<mpsc::UnboundedSender<Signal>>,

    /// Task running this connection's pipeline
    worker: Option<JoinHandle<()>>,

    /// Last ping/pong seen from the client
    last_heartbeat: Instant,
}

impl ConversationSocket {
    pub fn new(client_id: String, state: AppState) -> Self {
        Self {
            client_id,
            state,
            signals: None,
            worker: None,
            last_heartbeat: Instant::now(),
        }
    }

    /// Hand a decoded frame to the pipeline worker.
    fn forward(&mut self, signal: Signal, ctx: &mut ws::WebsocketContext<Self>) {
        let delivered = match &self.signals {
            Some(signals) => signals.send(signal).is_ok(),
            None => false,
        };

        if !delivered {
            warn!(client_id = %self.client_id, "Conversation worker is gone, closing connection");
            ctx.stop();
        }
    }
}

/// Frame queued for delivery to the client.
#[derive(Message)]
#[rtype(result = "()")]
enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Registry channel backed by the actor's mailbox.
struct ActorChannel {
    client_id: String,
    addr: Addr<ConversationSocket>,
}

impl ActorChannel {
    fn deliver(&self, frame: Outbound) -> Result<(), RelayError> {
        if !self.addr.connected() {
            return Err(RelayError::NoActiveConnection(self.client_id.clone()));
        }
        self.addr.do_send(frame);
        Ok(())
    }
}

#[async_trait]
impl Channel for ActorChannel {
    async fn send_text(&self, text: String) -> Result<(), RelayError> {
        self.deliver(Outbound::Text(text))
    }

    async fn send_binary(&self, bytes: Vec<u8>) -> Result<(), RelayError> {
        self.deliver(Outbound::Binary(bytes))
    }
}

impl Actor for ConversationSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Register the connection and start its pipeline worker.
    fn started(&mut self, ctx: &mut Self::Context) {
        let channel = Arc::new(ActorChannel {
            client_id: self.client_id.clone(),
            addr: ctx.address(),
        });
        self.state.registry.register(&self.client_id, channel);

        let (signals, inbound) = mpsc::unbounded_channel();
        let pipeline = ConversationPipeline::new(self.client_id.clone(), &self.state);
        self.worker = Some(actix_web::rt::spawn(pipeline.run(inbound)));
        self.signals = Some(signals);

        self.state.conversation.connection_opened();
        info!(client_id = %self.client_id, "WebSocket connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(client_id = %act.client_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Unregister the connection and drop whatever the pipeline was doing.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.registry.unregister(&self.client_id);
        self.signals = None;
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        self.state.conversation.connection_closed();
        info!(client_id = %self.client_id, "WebSocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConversationSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                debug!(client_id = %self.client_id, bytes = text.len(), "Text frame received");
                let signal = parse_frame(&text);
                self.forward(signal, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                warn!(
                    client_id = %self.client_id,
                    bytes = data.len(),
                    "Binary frame received, closing connection"
                );
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Unsupported,
                    description: Some("binary frames are not supported".to_string()),
                }));
                ctx.stop();
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(client_id = %self.client_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(client_id = %self.client_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(ws::ProtocolError::Overflow) => {
                warn!(
                    client_id = %self.client_id,
                    limit = self.state.config.server.max_frame_bytes,
                    "Frame exceeds size limit, closing connection"
                );
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Size,
                    description: Some("frame too large".to_string()),
                }));
                ctx.stop();
            }
            Err(err) => {
                error!(client_id = %self.client_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for ConversationSocket {
    type Result = ();

    fn handle(&mut self, frame: Outbound, ctx: &mut Self::Context) {
        match frame {
            Outbound::Text(text) => ctx.text(text),
            Outbound::Binary(bytes) => ctx.binary(bytes),
        }
    }
}

/// WebSocket endpoint handler for `GET /ws/{client_id}`.
///
/// ## HTTP to WebSocket Upgrade:
/// This function handles the initial HTTP request and upgrades it to a WebSocket
/// connection. The conversation itself is handled by the `ConversationSocket` actor.
/// Inbound frames up to `server.max_frame_bytes` are accepted; larger ones close the
/// connection with code 1009.
pub async fn conversation_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let client_id = path.into_inner();
    info!(
        client_id = %client_id,
        "New WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );

    let max_frame_bytes = state.config.server.max_frame_bytes;
    ws::WsResponseBuilder::new(
        ConversationSocket::new(client_id, state.get_ref().clone()),
        &req,
        stream,
    )
    .frame_size(max_frame_bytes)
    .start()
}

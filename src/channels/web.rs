//! Web chat channel — replies pushed to WebSocket subscribers of a thread.
//!
//! Inbound web messages arrive via `POST /api/chat`. Each connected client
//! subscribes to the broadcast and only receives events for the thread it
//! asked for in `GET /ws/chat?thread_id=…`.

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::channels::{ChannelAdapter, DeliveryReceipt, OutgoingReply};
use crate::error::ChannelError;
use crate::pipeline::types::Channel;

/// Message from server → web client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "response")]
    Response {
        thread_id: String,
        message_id: String,
        content: String,
    },
}

impl ServerMessage {
    fn thread_id(&self) -> &str {
        match self {
            Self::Response { thread_id, .. } => thread_id,
        }
    }
}

/// Broadcast-backed web chat adapter.
#[derive(Clone)]
pub struct WebChannel {
    outgoing_tx: broadcast::Sender<ServerMessage>,
}

impl Default for WebChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl WebChannel {
    pub fn new() -> Self {
        let (outgoing_tx, _) = broadcast::channel(256);
        Self { outgoing_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.outgoing_tx.subscribe()
    }

    /// Router with the `/ws/chat` endpoint; merge into the main app router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws/chat", get(ws_chat_handler))
            .with_state(self.clone())
    }
}

#[async_trait]
impl ChannelAdapter for WebChannel {
    fn channel(&self) -> Channel {
        Channel::Web
    }

    async fn send(&self, reply: &OutgoingReply) -> Result<DeliveryReceipt, ChannelError> {
        let event = ServerMessage::Response {
            thread_id: reply.thread_id.clone(),
            message_id: reply.message_id.clone(),
            content: reply.text.clone(),
        };
        // No subscribers just means no open tabs; history still has the reply.
        let listeners = self.outgoing_tx.send(event).unwrap_or(0);
        debug!(thread_id = %reply.thread_id, listeners, "Web reply broadcast");
        Ok(DeliveryReceipt::new(Some(reply.message_id.clone())))
    }
}

// ── WebSocket Handler ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatQuery {
    thread_id: String,
}

async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ChatQuery>,
    State(channel): State<WebChannel>,
) -> impl IntoResponse {
    info!(thread_id = %query.thread_id, "Web chat client connecting");
    let rx = channel.subscribe();
    ws.on_upgrade(move |socket| handle_chat_socket(socket, query.thread_id, rx))
}

async fn handle_chat_socket(
    mut socket: WebSocket,
    thread_id: String,
    mut outgoing_rx: broadcast::Receiver<ServerMessage>,
) {
    loop {
        tokio::select! {
            result = outgoing_rx.recv() => {
                match result {
                    Ok(msg) if msg.thread_id() == thread_id => {
                        if let Ok(json) = serde_json::to_string(&msg) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Web chat client disconnected during send");
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Web chat client lagged behind broadcast");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "Web chat WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(thread_id = %thread_id, "Web chat connection closed");
}

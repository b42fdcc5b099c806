//! WebSocket adapter.
//!
//! Outbound: the hub manager dials hub endpoints with `connect` and frames
//! JSON-RPC per text message, optionally coalescing bursts into arrays via
//! `MessageBatcher`. Inbound: a `/ws` route upgrades clients onto the same
//! message handler, capped at the configured connection limit.

use crate::adapters::http::HttpServerState;
use crate::error::{GatewayError, Result};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::time::Duration;

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Dial a WebSocket endpoint with a connect deadline.
pub async fn connect(url: &str, timeout: Duration) -> Result<WsStream> {
    let attempt = tokio_tungstenite::connect_async(url);
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(err)) => Err(GatewayError::Transport(format!(
            "websocket connect to `{url}` failed: {err}"
        ))),
        Err(_) => Err(GatewayError::Timeout(timeout.as_millis() as u64)),
    }
}

// ── Outbound batching ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct WsBatchOptions {
    pub enabled: bool,
    /// Flush as soon as this many messages are queued.
    pub batch_size: usize,
    /// Flush whatever is queued once the oldest message is this stale.
    pub batch_timeout_ms: u64,
    /// permessage-deflate toggle. The current WS stack does not negotiate
    /// the extension; the flag is accepted for config compatibility.
    pub compression: bool,
}

impl Default for WsBatchOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: 10,
            batch_timeout_ms: 50,
            compression: false,
        }
    }
}

/// Coalesces outbound messages into bounded batches.
///
/// `push` hands back a ready batch once `batch_size` is reached; the owner
/// is responsible for calling `flush` when `batch_timeout_ms` elapses
/// first. The queue never exceeds `batch_size`.
#[derive(Debug)]
pub struct MessageBatcher {
    options: WsBatchOptions,
    buffer: Vec<Value>,
}

impl MessageBatcher {
    pub fn new(options: WsBatchOptions) -> Self {
        if options.compression {
            tracing::debug!("websocket compression requested; extension not negotiated");
        }
        Self {
            options,
            buffer: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.options.batch_timeout_ms)
    }

    /// Queue a message. Returns a batch when it is time to send.
    pub fn push(&mut self, message: Value) -> Option<Vec<Value>> {
        if !self.options.enabled {
            return Some(vec![message]);
        }
        self.buffer.push(message);
        if self.buffer.len() >= self.options.batch_size {
            return self.flush();
        }
        None
    }

    /// Drain whatever is queued.
    pub fn flush(&mut self) -> Option<Vec<Value>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// Wire encoding: single messages stay bare, batches become an array.
    pub fn encode(batch: &[Value]) -> String {
        match batch {
            [single] => single.to_string(),
            many => Value::Array(many.to_vec()).to_string(),
        }
    }
}

// ── Inbound server mode ────────────────────────────────────────────────────

pub fn router() -> Router<HttpServerState> {
    Router::new().route("/ws", get(handle_ws_upgrade))
}

async fn handle_ws_upgrade(
    State(state): State<HttpServerState>,
    upgrade: WebSocketUpgrade,
) -> axum::response::Response {
    let cap = state.settings.max_clients;
    let active = state.ws_connections.clone();
    if active.fetch_add(1, Ordering::SeqCst) >= cap {
        active.fetch_sub(1, Ordering::SeqCst);
        return (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "websocket connection limit reached",
        )
            .into_response();
    }

    upgrade.on_upgrade(move |socket| async move {
        serve_socket(state, socket).await;
        active.fetch_sub(1, Ordering::SeqCst);
    })
}

async fn serve_socket(state: HttpServerState, mut socket: WebSocket) {
    while let Some(frame) = socket.recv().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!("websocket receive failed: {err}");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                if let Some(response) = state.handler.handle_text(&text).await {
                    let body = match serde_json::to_string(&response) {
                        Ok(body) => body,
                        Err(err) => {
                            tracing::error!("websocket response serialization failed: {err}");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(body.into())).await.is_err() {
                        break;
                    }
                }
            }
            Message::Ping(payload) => {
                if socket.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

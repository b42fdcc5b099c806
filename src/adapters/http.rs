//! HTTP adapter: the gateway's SSE and streamable-HTTP surfaces.
//!
//! Routes:
//!   GET  /sse       open an event stream; first event announces the
//!                   per-session message endpoint
//!   POST /messages  submit a JSON-RPC message for an open session (202)
//!   POST /rpc       direct request/response JSON-RPC
//!   POST /mcp       streamable HTTP: JSON body in, JSON body out (204
//!                   for notifications)
//!   GET  /mcp       streamable HTTP event stream (session in the first
//!                   `connected` event)
//!   GET  /status    gateway status document
//!   GET  /health    liveness probe

use crate::adapters::session::{SessionRegistry, SseEvent};
use crate::adapters::{AdapterCore, AdapterState, TransportAdapter};
use crate::config::schema::GatewaySettings;
use crate::error::{GatewayError, Result};
use crate::handler::MessageHandler;
use crate::protocol::{
    JsonRpcResponse, INVALID_REQUEST, LATEST_PROTOCOL_VERSION, SERVER_BUSY,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use parking_lot::Mutex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::limit::RequestBodyLimitLayer;

const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const RESPONSE_TIME_HEADER: &str = "X-Response-Time";

#[derive(Clone)]
pub struct HttpServerState {
    pub handler: Arc<MessageHandler>,
    pub sessions: Arc<SessionRegistry>,
    pub settings: GatewaySettings,
    pub started_at: Instant,
    pub ws_connections: Arc<std::sync::atomic::AtomicUsize>,
}

impl HttpServerState {
    pub fn new(handler: Arc<MessageHandler>, settings: GatewaySettings) -> Self {
        let sessions = SessionRegistry::new(
            settings.max_clients,
            Duration::from_millis(settings.session_timeout_ms),
        );
        Self {
            handler,
            sessions,
            settings,
            started_at: Instant::now(),
            ws_connections: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }
}

pub fn router(state: HttpServerState) -> Router {
    let body_limit = state.settings.max_message_size + 1024;
    Router::new()
        .route("/sse", get(handle_sse_open))
        .route("/messages", post(handle_session_message))
        .route("/rpc", post(handle_rpc))
        .route("/mcp", post(handle_mcp_post).get(handle_mcp_stream))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .merge(super::websocket::router())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

// ── SSE surface ────────────────────────────────────────────────────────────

fn busy_response() -> axum::response::Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(JsonRpcResponse::error(
            None,
            SERVER_BUSY,
            "server busy: SSE client limit reached",
        )),
    )
        .into_response()
}

fn session_event_stream(
    rx: tokio::sync::mpsc::Receiver<SseEvent>,
) -> impl Stream<Item = std::result::Result<Event, std::convert::Infallible>> {
    ReceiverStream::new(rx).map(|e| Ok(Event::default().event(e.event).data(e.data)))
}

async fn handle_sse_open(State(state): State<HttpServerState>) -> axum::response::Response {
    let Some((session, rx)) = state.sessions.open() else {
        return busy_response();
    };

    let endpoint = format!("/messages?sessionId={}", session.id());
    if !session.send(SseEvent::new("endpoint", endpoint)).await {
        state.sessions.close(session.id());
        return busy_response();
    }
    tracing::info!("SSE session {} opened", session.id());

    Sse::new(session_event_stream(rx)).into_response()
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn handle_session_message(
    State(state): State<HttpServerState>,
    Query(query): Query<SessionQuery>,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let Some(session) = state.sessions.get(&query.session_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "unknown sessionId"})),
        )
            .into_response();
    };
    session.touch();

    // Accept immediately; the reply (including any error) rides the
    // session's event stream.
    let handler = state.handler.clone();
    let sessions = state.sessions.clone();
    let raw = String::from_utf8_lossy(&body).to_string();
    tokio::spawn(async move {
        if let Some(response) = handler.handle_text(&raw).await {
            let payload = match serde_json::to_value(&response) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::error!("failed to serialize SSE reply: {err}");
                    return;
                }
            };
            if !session.send(SseEvent::message(&payload)).await {
                sessions.close(session.id());
            }
        }
    });

    StatusCode::ACCEPTED.into_response()
}

// ── Direct JSON-RPC ────────────────────────────────────────────────────────

async fn handle_rpc(
    State(state): State<HttpServerState>,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let raw = String::from_utf8_lossy(&body);
    match state.handler.handle_text(&raw).await {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

// ── Streamable HTTP ────────────────────────────────────────────────────────

fn mcp_headers(elapsed: Duration) -> [(&'static str, String); 2] {
    [
        (PROTOCOL_VERSION_HEADER, LATEST_PROTOCOL_VERSION.to_string()),
        (RESPONSE_TIME_HEADER, format!("{}ms", elapsed.as_millis())),
    ]
}

fn check_protocol_header(headers: &HeaderMap) {
    if let Some(version) = headers
        .get(PROTOCOL_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
            tracing::warn!("client sent unsupported {PROTOCOL_VERSION_HEADER} `{version}`");
        }
    }
}

async fn handle_mcp_post(
    State(state): State<HttpServerState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let start = Instant::now();
    check_protocol_header(&headers);

    if body.len() > state.settings.max_message_size {
        let response = JsonRpcResponse::error(
            None,
            INVALID_REQUEST,
            format!(
                "request body of {} bytes exceeds limit of {}",
                body.len(),
                state.settings.max_message_size
            ),
        );
        return (mcp_headers(start.elapsed()), Json(response)).into_response();
    }

    let raw = String::from_utf8_lossy(&body);
    match state.handler.handle_text(&raw).await {
        Some(response) => {
            (mcp_headers(start.elapsed()), Json(response)).into_response()
        }
        None => (StatusCode::NO_CONTENT, mcp_headers(start.elapsed())).into_response(),
    }
}

async fn handle_mcp_stream(State(state): State<HttpServerState>) -> axum::response::Response {
    let Some((session, rx)) = state.sessions.open() else {
        return busy_response();
    };

    let hello = SseEvent::new(
        "connected",
        serde_json::json!({"sessionId": session.id()}).to_string(),
    );
    if !session.send(hello).await {
        state.sessions.close(session.id());
        return busy_response();
    }
    tracing::info!("streamable HTTP session {} opened", session.id());

    Sse::new(session_event_stream(rx)).into_response()
}

// ── Status surfaces ────────────────────────────────────────────────────────

async fn handle_status(State(state): State<HttpServerState>) -> axum::response::Response {
    let manager = state.handler.manager().get_status().await;
    Json(serde_json::json!({
        "status": "running",
        "mode": "http",
        "clients": state.sessions.client_count(),
        "uptime": state.started_at.elapsed().as_secs(),
        "services": manager,
    }))
    .into_response()
}

async fn handle_health() -> axum::response::Response {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response()
}

// ── Adapter wrapper ────────────────────────────────────────────────────────

pub struct HttpSseAdapter {
    core: AdapterCore,
    state: HttpServerState,
    port: u16,
    bound_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl HttpSseAdapter {
    pub fn new(handler: Arc<MessageHandler>, settings: GatewaySettings) -> Self {
        let port = settings.http_port;
        Self {
            core: AdapterCore::new("http"),
            state: HttpServerState::new(handler, settings),
            port,
            bound_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Address actually bound, available after `start`.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    pub fn server_state(&self) -> &HttpServerState {
        &self.state
    }
}

#[async_trait::async_trait]
impl TransportAdapter for HttpSseAdapter {
    async fn initialize(&self) -> Result<()> {
        self.core.reset();
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.core.begin_connect()?;

        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", self.port)).await {
            Ok(listener) => listener,
            Err(err) => {
                self.core.mark_error();
                return Err(GatewayError::Transport(format!(
                    "failed to bind port {}: {err}",
                    self.port
                )));
            }
        };
        let addr = listener.local_addr()?;
        *self.bound_addr.lock() = Some(addr);

        let app = router(self.state.clone());
        let server = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!("HTTP adapter server failed: {err}");
            }
        });
        let maintenance = self.state.sessions.spawn_maintenance();

        let mut tasks = self.tasks.lock();
        tasks.push(server);
        tasks.push(maintenance);

        self.core.mark_connected();
        tracing::info!("HTTP adapter listening on {addr}");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.bound_addr.lock() = None;
        self.core.mark_disconnected();
        Ok(())
    }

    async fn send_message(&self, message: serde_json::Value) -> Result<()> {
        if self.state() != AdapterState::Connected {
            return Err(GatewayError::NotConnected("HTTP adapter".into()));
        }
        // Broadcast to every open session.
        let event = SseEvent::message(&message);
        for session in self.state.sessions.snapshot() {
            if !session.send(event.clone()).await {
                self.state.sessions.close(session.id());
            }
        }
        Ok(())
    }

    fn connection_id(&self) -> String {
        self.core.id().to_string()
    }

    fn state(&self) -> AdapterState {
        self.core.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::ConfigStore;
    use crate::events::EventBus;
    use crate::manager::ServiceManager;
    use crate::registry::ToolRegistry;
    use serde_json::json;

    async fn serve() -> (tempfile::TempDir, SocketAddr, HttpServerState) {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigStore::load_from_dir(dir.path()).unwrap();
        let registry = ToolRegistry::new(config.clone());
        let cache = CacheStore::load_from_dir(dir.path());
        let manager = ServiceManager::new(config, registry, cache, EventBus::new());
        let handler = MessageHandler::new(manager);

        let settings = GatewaySettings {
            max_clients: 2,
            max_message_size: 512,
            ..Default::default()
        };
        let state = HttpServerState::new(handler, settings);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (dir, addr, state)
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let (_dir, addr, _state) = serve().await;
        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn status_endpoint_reports_mode_and_clients() {
        let (_dir, addr, _state) = serve().await;
        let body: serde_json::Value = reqwest::get(format!("http://{addr}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "running");
        assert_eq!(body["mode"], "http");
        assert_eq!(body["clients"], 0);
        assert!(body["services"]["services"].is_array());
    }

    #[tokio::test]
    async fn rpc_endpoint_direct_roundtrip() {
        let (_dir, addr, _state) = serve().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/rpc"))
            .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"], json!({}));
    }

    #[tokio::test]
    async fn rpc_notification_returns_no_content() {
        let (_dir, addr, _state) = serve().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/rpc"))
            .json(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204);
    }

    #[tokio::test]
    async fn mcp_post_carries_protocol_and_timing_headers() {
        let (_dir, addr, _state) = serve().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/mcp"))
            .json(&json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response
                .headers()
                .get(PROTOCOL_VERSION_HEADER)
                .unwrap()
                .to_str()
                .unwrap(),
            LATEST_PROTOCOL_VERSION
        );
        assert!(response.headers().contains_key(RESPONSE_TIME_HEADER));
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["id"], 7);
        assert!(body["result"]["tools"].is_array());
    }

    #[tokio::test]
    async fn mcp_post_notification_is_204() {
        let (_dir, addr, _state) = serve().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/mcp"))
            .json(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204);
        assert!(response.headers().contains_key(PROTOCOL_VERSION_HEADER));
    }

    #[tokio::test]
    async fn mcp_post_body_size_boundary() {
        let (_dir, addr, _state) = serve().await;
        let client = reqwest::Client::new();

        // Exactly at the limit: padding brings the envelope to 512 bytes.
        let frame = |padding: usize| {
            let base = json!({"jsonrpc": "2.0", "id": 1, "method": "ping", "params": {"pad": ""}});
            let overhead = serde_json::to_string(&base).unwrap().len();
            let mut body = serde_json::to_string(&base).unwrap();
            let fill = "x".repeat(512 - overhead + padding);
            body = body.replace("\"pad\":\"\"", &format!("\"pad\":\"{fill}\""));
            body
        };

        let at_limit = frame(0);
        assert_eq!(at_limit.len(), 512);
        let response = client
            .post(format!("http://{addr}/mcp"))
            .header("content-type", "application/json")
            .body(at_limit)
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body.get("error").is_none(), "at-limit body was rejected");

        let over_limit = frame(1);
        assert_eq!(over_limit.len(), 513);
        let response = client
            .post(format!("http://{addr}/mcp"))
            .header("content-type", "application/json")
            .body(over_limit)
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn sse_session_lifecycle_roundtrip() {
        let (_dir, addr, _state) = serve().await;
        let client = reqwest::Client::new();

        let response = client
            .get(format!("http://{addr}/sse"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let mut stream = response.bytes_stream();
        let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let first = String::from_utf8_lossy(&first).to_string();
        assert!(first.contains("event: endpoint"));
        let session_id = first
            .split("sessionId=")
            .nth(1)
            .unwrap()
            .split_whitespace()
            .next()
            .unwrap()
            .to_string();

        let post = client
            .post(format!("http://{addr}/messages?sessionId={session_id}"))
            .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .send()
            .await
            .unwrap();
        assert_eq!(post.status(), 202);

        let reply = tokio::time::timeout(Duration::from_millis(500), stream.next())
            .await
            .expect("no SSE reply within deadline")
            .unwrap()
            .unwrap();
        let reply = String::from_utf8_lossy(&reply).to_string();
        assert!(reply.contains("event: message"));
        assert!(reply.contains("\"id\":1"));
        assert!(reply.contains("tools"));
    }

    #[tokio::test]
    async fn messages_with_unknown_session_is_404() {
        let (_dir, addr, _state) = serve().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/messages?sessionId=missing"))
            .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn sse_cap_returns_503_with_busy_code() {
        let (_dir, addr, _state) = serve().await;
        let client = reqwest::Client::new();

        // max_clients = 2 in the test settings; hold both streams open.
        let _first = client.get(format!("http://{addr}/sse")).send().await.unwrap();
        let _second = client.get(format!("http://{addr}/sse")).send().await.unwrap();

        let third = client.get(format!("http://{addr}/sse")).send().await.unwrap();
        assert_eq!(third.status(), 503);
        let body: serde_json::Value = third.json().await.unwrap();
        assert_eq!(body["error"]["code"], -32000);
    }

    #[tokio::test]
    async fn mcp_get_opens_connected_session() {
        let (_dir, addr, _state) = serve().await;
        let client = reqwest::Client::new();
        let response = client.get(format!("http://{addr}/mcp")).send().await.unwrap();
        assert_eq!(response.status(), 200);

        let mut stream = response.bytes_stream();
        let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let first = String::from_utf8_lossy(&first).to_string();
        assert!(first.contains("event: connected"));
        assert!(first.contains("sessionId"));
    }
}

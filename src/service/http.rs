//! HTTP-based transport clients: SSE and streamable HTTP.
//!
//! Both speak the same JSON-RPC envelopes as stdio. SSE keeps one GET
//! stream open for responses and POSTs requests to the endpoint announced
//! in the first `endpoint` event; streamable HTTP POSTs each request to a
//! single `/mcp`-style URL and reads the reply from the response body.

use crate::config::schema::{ServiceConfig, TransportKind};
use crate::error::{GatewayError, Result};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::service::transport::{RequestOutcome, ServiceClient};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ── SSE framing ────────────────────────────────────────────────────────────

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental SSE parser. Feed it chunks as they arrive; complete frames
/// come back in order.
#[derive(Debug, Default)]
pub struct SseFrameParser {
    buffer: String,
}

impl SseFrameParser {
    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        // Normalize CRLF once so frame splitting only deals with \n\n.
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        while let Some(split) = self.buffer.find("\n\n") {
            let raw: String = self.buffer.drain(..split + 2).collect();
            if let Some(frame) = parse_frame(&raw) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event = String::from("message");
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim_start().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // Comment lines (":") and "id:"/"retry:" fields are ignored.
    }

    if data_lines.is_empty() && event == "message" {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

// ── Shared HTTP plumbing ───────────────────────────────────────────────────

fn build_http_client(config: &ServiceConfig) -> Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    for (key, value) in &config.headers {
        let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| GatewayError::Validation(format!("bad header name `{key}`: {e}")))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| GatewayError::Validation(format!("bad header value for `{key}`: {e}")))?;
        headers.insert(name, value);
    }
    if let Some(api_key) = &config.api_key {
        let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| GatewayError::Validation(format!("bad api key: {e}")))?;
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {e}")))
}

fn require_url(name: &str, config: &ServiceConfig) -> Result<reqwest::Url> {
    let raw = config.url.as_deref().ok_or_else(|| {
        GatewayError::Validation(format!("service `{name}` has no url for HTTP transport"))
    })?;
    reqwest::Url::parse(raw)
        .map_err(|e| GatewayError::Validation(format!("service `{name}` url `{raw}`: {e}")))
}

fn response_from_value(service: &str, value: Value) -> Result<Value> {
    let response: JsonRpcResponse = serde_json::from_value(value)
        .map_err(|e| GatewayError::Transport(format!("service `{service}`: bad response: {e}")))?;
    match response.error {
        Some(err) => Err(GatewayError::Upstream(format!(
            "{} (code {})",
            err.message, err.code
        ))),
        None => Ok(response.result.unwrap_or(Value::Null)),
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

// ── SSE client ─────────────────────────────────────────────────────────────

pub struct SseClient {
    name: String,
    http: reqwest::Client,
    message_url: reqwest::Url,
    pending: PendingMap,
    next_id: AtomicU64,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SseClient {
    /// Open the event stream and wait for the `endpoint` announcement.
    pub async fn connect(name: &str, config: &ServiceConfig) -> Result<Self> {
        let base = require_url(name, config)?;
        let http = build_http_client(config)?;

        let response = http
            .get(base.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("SSE connect to `{name}`: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::Transport(format!(
                "SSE connect to `{name}` returned HTTP {}",
                response.status()
            )));
        }

        let mut stream = response.bytes_stream();
        let mut parser = SseFrameParser::default();
        let mut endpoint: Option<String> = None;
        let mut backlog: Vec<SseFrame> = Vec::new();

        while endpoint.is_none() {
            let chunk = match stream.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    return Err(GatewayError::Transport(format!(
                        "SSE stream from `{name}` failed: {err}"
                    )));
                }
                None => {
                    return Err(GatewayError::Transport(format!(
                        "SSE stream from `{name}` closed before `endpoint` event"
                    )));
                }
            };
            for frame in parser.push(&String::from_utf8_lossy(&chunk)) {
                if frame.event == "endpoint" && endpoint.is_none() {
                    endpoint = Some(frame.data.trim().to_string());
                } else {
                    backlog.push(frame);
                }
            }
        }

        let message_url = base.join(endpoint.as_deref().unwrap_or_default()).map_err(|e| {
            GatewayError::Transport(format!("service `{name}`: bad endpoint path: {e}"))
        })?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        for frame in &backlog {
            handle_stream_frame(name, frame, &pending);
        }

        let reader = {
            let pending = pending.clone();
            let service = name.to_string();
            tokio::spawn(async move {
                while let Some(chunk) = stream.next().await {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            tracing::warn!("service `{service}`: SSE stream failed: {err}");
                            break;
                        }
                    };
                    for frame in parser.push(&String::from_utf8_lossy(&chunk)) {
                        handle_stream_frame(&service, &frame, &pending);
                    }
                }
                pending.lock().clear();
            })
        };

        Ok(Self {
            name: name.to_string(),
            http,
            message_url,
            pending,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(Some(reader)),
        })
    }
}

fn handle_stream_frame(service: &str, frame: &SseFrame, pending: &PendingMap) {
    if frame.event != "message" {
        tracing::debug!("service `{service}`: ignoring SSE event `{}`", frame.event);
        return;
    }
    let response: JsonRpcResponse = match serde_json::from_str(&frame.data) {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!("service `{service}`: unparseable SSE message ({err})");
            return;
        }
    };
    let Some(id) = response.id.as_ref().and_then(Value::as_u64) else {
        tracing::debug!("service `{service}`: SSE message without numeric id");
        return;
    };
    match pending.lock().remove(&id) {
        Some(tx) => {
            let _ = tx.send(response);
        }
        None => tracing::debug!("service `{service}`: SSE response for unknown id {id}"),
    }
}

#[async_trait::async_trait]
impl ServiceClient for SseClient {
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<RequestOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let post = self
            .http
            .post(self.message_url.clone())
            .json(&request)
            .send()
            .await;
        match post {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                self.pending.lock().remove(&id);
                return Err(GatewayError::Transport(format!(
                    "service `{}` rejected message: HTTP {}",
                    self.name,
                    response.status()
                )));
            }
            Err(err) => {
                self.pending.lock().remove(&id);
                return Err(GatewayError::Transport(format!(
                    "POST to `{}` failed: {err}",
                    self.name
                )));
            }
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(GatewayError::Transport(format!(
                    "SSE stream for `{}` closed before replying to `{method}`",
                    self.name
                )));
            }
            Err(_) => {
                // Same contract as stdio: the pending slot resolves with
                // the timeout marker and any late reply is dropped.
                self.pending.lock().remove(&id);
                return Ok(RequestOutcome::TimedOut {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        match response.error {
            Some(err) => Err(GatewayError::Upstream(format!(
                "{} (code {})",
                err.message, err.code
            ))),
            None => Ok(RequestOutcome::Reply(response.result.unwrap_or(Value::Null))),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let request = JsonRpcRequest::notification(method, params);
        self.http
            .post(self.message_url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("POST to `{}` failed: {e}", self.name)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.pending.lock().clear();
        Ok(())
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Sse
    }
}

// ── Streamable HTTP client ─────────────────────────────────────────────────

pub struct StreamableHttpClient {
    name: String,
    http: reqwest::Client,
    url: reqwest::Url,
    next_id: AtomicU64,
    session_id: Mutex<Option<String>>,
}

impl StreamableHttpClient {
    pub fn new(name: &str, config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            http: build_http_client(config)?,
            url: require_url(name, config)?,
            next_id: AtomicU64::new(1),
            session_id: Mutex::new(None),
        })
    }

    fn apply_session(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.session_id.lock().as_deref() {
            Some(session) => builder.header("Mcp-Session-Id", session),
            None => builder,
        }
    }

    fn capture_session(&self, response: &reqwest::Response) {
        if let Some(session) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }
    }

    async fn post(&self, request: &JsonRpcRequest, timeout: Duration) -> Result<reqwest::Response> {
        let builder = self
            .http
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .timeout(timeout)
            .json(request);

        let response = self
            .apply_session(builder)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(timeout.as_millis() as u64)
                } else {
                    GatewayError::Transport(format!("POST to `{}` failed: {e}", self.name))
                }
            })?;
        self.capture_session(&response);
        Ok(response)
    }
}

/// Pull the first `message` frame out of an event-stream body.
fn first_message_from_event_stream(body: &str) -> Option<Value> {
    let mut parser = SseFrameParser::default();
    let mut frames = parser.push(body);
    // The final frame may lack a trailing blank line.
    frames.extend(parser.push("\n\n"));
    frames
        .into_iter()
        .filter(|f| f.event == "message")
        .find_map(|f| serde_json::from_str(&f.data).ok())
}

#[async_trait::async_trait]
impl ServiceClient for StreamableHttpClient {
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<RequestOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let response = match self.post(&request, timeout).await {
            Ok(response) => response,
            Err(GatewayError::Timeout(timeout_ms)) => {
                return Ok(RequestOutcome::TimedOut { timeout_ms });
            }
            Err(err) => return Err(err),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Transport(format!(
                "service `{}` returned HTTP {status}",
                self.name
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(format!("reading `{}` reply: {e}", self.name)))?;

        let value = if content_type.starts_with("text/event-stream") {
            first_message_from_event_stream(&body).ok_or_else(|| {
                GatewayError::Transport(format!(
                    "service `{}` event-stream reply had no message",
                    self.name
                ))
            })?
        } else {
            serde_json::from_str(&body).map_err(|e| {
                GatewayError::Transport(format!("service `{}` reply unparseable: {e}", self.name))
            })?
        };

        response_from_value(&self.name, value).map(RequestOutcome::Reply)
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let request = JsonRpcRequest::notification(method, params);
        let response = self.post(&request, CONNECT_TIMEOUT).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::Transport(format!(
                "service `{}` rejected notification: HTTP {}",
                self.name,
                response.status()
            )))
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn transport(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_parser_splits_frames() {
        let mut parser = SseFrameParser::default();
        let frames = parser.push("event: endpoint\ndata: /messages?sessionId=abc\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "endpoint");
        assert_eq!(frames[0].data, "/messages?sessionId=abc");
    }

    #[test]
    fn sse_parser_handles_partial_chunks() {
        let mut parser = SseFrameParser::default();
        assert!(parser.push("event: mess").is_empty());
        assert!(parser.push("age\ndata: {\"a\":").is_empty());
        let frames = parser.push("1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, "{\"a\":1}");
    }

    #[test]
    fn sse_parser_joins_multiline_data() {
        let mut parser = SseFrameParser::default();
        let frames = parser.push("data: line1\ndata: line2\n\n");
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[test]
    fn sse_parser_normalizes_crlf() {
        let mut parser = SseFrameParser::default();
        let frames = parser.push("event: heartbeat\r\ndata: {}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "heartbeat");
    }

    #[test]
    fn sse_parser_skips_comments_and_empty_frames() {
        let mut parser = SseFrameParser::default();
        let frames = parser.push(": keepalive\n\nevent: x\ndata: 1\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "x");
    }

    #[test]
    fn first_message_scans_event_stream_bodies() {
        let body = "event: ping\ndata: {}\n\nevent: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":5}\n\n";
        let value = first_message_from_event_stream(body).unwrap();
        assert_eq!(value["result"], 5);

        // Trailing frame without the final blank line still parses.
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":7}";
        let value = first_message_from_event_stream(body).unwrap();
        assert_eq!(value["result"], 7);
    }

    #[test]
    fn streamable_client_requires_url() {
        let config = ServiceConfig::default();
        assert!(matches!(
            StreamableHttpClient::new("s", &config),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn response_from_value_maps_upstream_errors() {
        let err = response_from_value(
            "s",
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "busy"}}),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Upstream(_)));
        assert!(err.to_string().contains("busy"));
    }
}

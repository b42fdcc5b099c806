//! Hub connection manager.
//!
//! Keeps one independent outbound WebSocket session per configured hub
//! endpoint. Each session presents the aggregated registry as a single
//! MCP server: inbound frames go through the shared message handler, and
//! registry changes are pushed out to every established session. There is
//! no balancing or failover across endpoints.

pub mod endpoint;

use crate::adapters::websocket::{self, MessageBatcher, WsBatchOptions};
use crate::config::schema::HubOptions;
use crate::error::{GatewayError, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::handler::MessageHandler;
use crate::protocol::ToolDef;
use endpoint::{
    classify_error, validate_options, EndpointState, EndpointStatus, ErrorClass,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

/// Period of the history-pruning memory pass.
const MEMORY_OPTIMIZE_INTERVAL: Duration = Duration::from_secs(300);

/// Capability the hub manager needs from the service side.
pub trait ToolSource: Send + Sync {
    fn tool_defs(&self) -> Vec<ToolDef>;
}

impl ToolSource for crate::manager::ServiceManager {
    fn tool_defs(&self) -> Vec<ToolDef> {
        crate::manager::ServiceManager::tool_defs(self)
    }
}

enum SessionCommand {
    Send(serde_json::Value),
    Ping(oneshot::Sender<()>),
}

struct EndpointEntry {
    status: Arc<Mutex<EndpointStatus>>,
    session_tx: Option<mpsc::Sender<SessionCommand>>,
    session_task: Option<tokio::task::JoinHandle<()>>,
    reconnect_task: Option<tokio::task::JoinHandle<()>>,
}

impl EndpointEntry {
    fn new(url: &str) -> Self {
        Self {
            status: Arc::new(Mutex::new(EndpointStatus::new(url))),
            session_tx: None,
            session_task: None,
            reconnect_task: None,
        }
    }

    fn teardown(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        if let Some(task) = self.session_task.take() {
            task.abort();
        }
        self.session_tx = None;
    }
}

pub struct HubConnectionManager {
    endpoints: Mutex<HashMap<String, EndpointEntry>>,
    options: Mutex<HubOptions>,
    batch_options: Mutex<WsBatchOptions>,
    handler: Arc<MessageHandler>,
    tools: Arc<dyn ToolSource>,
    events: EventBus,
    running: AtomicBool,
    loops: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl HubConnectionManager {
    pub fn new(
        handler: Arc<MessageHandler>,
        tools: Arc<dyn ToolSource>,
        options: HubOptions,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
            options: Mutex::new(options),
            batch_options: Mutex::new(WsBatchOptions::default()),
            handler,
            tools,
            events,
            running: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
        })
    }

    /// Seed the endpoint set without connecting.
    pub fn initialize(&self, endpoints: &[String]) -> Result<()> {
        for url in endpoints {
            validate_endpoint_url(url)?;
        }
        let mut map = self.endpoints.lock();
        for url in endpoints {
            map.entry(url.clone())
                .or_insert_with(|| EndpointEntry::new(url));
        }
        Ok(())
    }

    /// Open every session and start the background loops.
    pub async fn connect(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.spawn_loops();

        let urls: Vec<String> = self.endpoints.lock().keys().cloned().collect();
        for url in urls {
            self.attempt_connect(&url, None).await;
        }
    }

    /// Stop everything: loops, reconnect timers, sessions. Idempotent.
    pub async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.loops.lock().drain(..) {
            task.abort();
        }
        let mut map = self.endpoints.lock();
        for entry in map.values_mut() {
            entry.teardown();
            let mut status = entry.status.lock();
            if status.state != EndpointState::Failed {
                status.state = EndpointState::Disconnected;
            }
            status.next_reconnect_at = None;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Endpoint set management ────────────────────────────────────────

    pub async fn add_endpoint(self: &Arc<Self>, url: &str) -> Result<()> {
        validate_endpoint_url(url)?;
        {
            let mut map = self.endpoints.lock();
            if map.contains_key(url) {
                return Err(GatewayError::Conflict(format!(
                    "hub endpoint `{url}` already exists"
                )));
            }
            map.insert(url.to_string(), EndpointEntry::new(url));
        }
        if self.is_running() {
            self.attempt_connect(url, None).await;
        }
        Ok(())
    }

    /// Remove an endpoint. After this returns no reconnect timer for it
    /// will fire again.
    pub fn remove_endpoint(&self, url: &str) -> Result<()> {
        let mut map = self.endpoints.lock();
        let mut entry = map.remove(url).ok_or_else(|| {
            GatewayError::NotFound(format!("hub endpoint `{url}` is not configured"))
        })?;
        entry.teardown();
        Ok(())
    }

    /// Diff the configured set against `urls`: removed endpoints are torn
    /// down first, new ones added, survivors left undisturbed.
    pub async fn update_endpoints(self: &Arc<Self>, urls: &[String]) -> Result<(Vec<String>, Vec<String>)> {
        for url in urls {
            validate_endpoint_url(url)?;
        }

        let current: Vec<String> = self.endpoints.lock().keys().cloned().collect();
        let removed: Vec<String> = current
            .iter()
            .filter(|url| !urls.contains(*url))
            .cloned()
            .collect();
        let added: Vec<String> = urls
            .iter()
            .filter(|url| !current.contains(*url))
            .cloned()
            .collect();

        for url in &removed {
            let _ = self.remove_endpoint(url);
        }
        for url in &added {
            self.add_endpoint(url).await?;
        }
        Ok((added, removed))
    }

    pub fn update_options(&self, options: HubOptions) -> Result<()> {
        validate_options(&options)?;
        *self.options.lock() = options;
        Ok(())
    }

    pub fn update_batch_options(&self, options: WsBatchOptions) {
        *self.batch_options.lock() = options;
    }

    /// Hot reload: endpoints and/or options in one step, with a
    /// `configChange` event describing the delta.
    pub async fn reload_config(
        self: &Arc<Self>,
        endpoints: Option<Vec<String>>,
        options: Option<HubOptions>,
    ) -> Result<()> {
        if let Some(options) = &options {
            validate_options(options)?;
        }

        let (added, removed) = match endpoints {
            Some(urls) => self.update_endpoints(&urls).await?,
            None => (Vec::new(), Vec::new()),
        };
        if let Some(options) = options {
            *self.options.lock() = options;
        }

        self.events
            .publish(GatewayEvent::ConfigChange { added, removed });
        Ok(())
    }

    // ── Status ─────────────────────────────────────────────────────────

    pub fn status(&self) -> Vec<EndpointStatus> {
        let mut all: Vec<EndpointStatus> = self
            .endpoints
            .lock()
            .values()
            .map(|entry| entry.status.lock().clone())
            .collect();
        all.sort_by(|a, b| a.endpoint_url.cmp(&b.endpoint_url));
        all
    }

    pub fn endpoint_status(&self, url: &str) -> Option<EndpointStatus> {
        self.endpoints
            .lock()
            .get(url)
            .map(|entry| entry.status.lock().clone())
    }

    /// Subscribe to hub lifecycle events (`configChange`,
    /// `connectionError`, `connectionRecovered`, ...).
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ── Tool sync ──────────────────────────────────────────────────────

    /// Push the current aggregated tool list to every established session.
    pub async fn sync_tools(&self) {
        let tools = self.tools.tool_defs();
        let notification = json!({
            "jsonrpc": "2.0",
            "method": "notifications/tools/list_changed",
            "params": {"tools": tools},
        });

        let senders: Vec<(String, mpsc::Sender<SessionCommand>)> = self
            .endpoints
            .lock()
            .iter()
            .filter_map(|(url, entry)| {
                entry
                    .session_tx
                    .clone()
                    .map(|tx| (url.clone(), tx))
            })
            .collect();

        for (url, tx) in senders {
            if tx
                .send(SessionCommand::Send(notification.clone()))
                .await
                .is_err()
            {
                tracing::debug!("tool sync to `{url}` skipped; session closing");
            }
        }
    }

    // ── Reconnect control ──────────────────────────────────────────────

    /// Force an immediate reconnect attempt, bypassing the interval.
    pub async fn trigger_reconnect(self: &Arc<Self>, url: &str) -> Result<()> {
        {
            let mut map = self.endpoints.lock();
            let entry = map.get_mut(url).ok_or_else(|| {
                GatewayError::NotFound(format!("hub endpoint `{url}` is not configured"))
            })?;
            entry.teardown();
            let mut status = entry.status.lock();
            status.state = EndpointState::Connecting;
            status.next_reconnect_at = None;
        }
        let attempt = {
            let map = self.endpoints.lock();
            let Some(entry) = map.get(url) else { return Ok(()) };
            let mut status = entry.status.lock();
            status.reconnect_attempts += 1;
            status.reconnect_attempts
        };
        self.attempt_connect(url, Some(attempt)).await;
        Ok(())
    }

    /// Cancel a pending reconnect timer, leaving the endpoint alone until
    /// an explicit trigger.
    pub fn stop_reconnect(&self, url: &str) -> Result<()> {
        let mut map = self.endpoints.lock();
        let entry = map.get_mut(url).ok_or_else(|| {
            GatewayError::NotFound(format!("hub endpoint `{url}` is not configured"))
        })?;
        if let Some(task) = entry.reconnect_task.take() {
            task.abort();
        }
        let mut status = entry.status.lock();
        if status.state == EndpointState::Reconnecting {
            status.state = EndpointState::Disconnected;
        }
        status.next_reconnect_at = None;
        Ok(())
    }

    // ── Connection internals ───────────────────────────────────────────

    /// One connect attempt. `reconnect_attempt` is Some(n) when this is
    /// the n-th scheduled reconnect, which is what lands in the history.
    async fn attempt_connect(self: &Arc<Self>, url: &str, reconnect_attempt: Option<u32>) {
        let status_handle = {
            let map = self.endpoints.lock();
            let Some(entry) = map.get(url) else {
                return;
            };
            entry.status.lock().state = EndpointState::Connecting;
            entry.status.clone()
        };

        let timeout = {
            let options = self.options.lock();
            Duration::from_millis(options.connection_timeout_ms)
        };

        match websocket::connect(url, timeout).await {
            Ok(stream) => {
                let (tx, rx) = mpsc::channel::<SessionCommand>(64);
                let session_task = self.spawn_session(url, stream, rx);

                let installed = {
                    let mut map = self.endpoints.lock();
                    match map.get_mut(url) {
                        Some(entry) => {
                            entry.session_tx = Some(tx);
                            entry.session_task = Some(session_task);
                            let mut status = entry.status.lock();
                            if let Some(attempt) = reconnect_attempt {
                                status.push_reconnect_record(attempt, true, None);
                            }
                            status.mark_connected();
                            true
                        }
                        // Endpoint was removed while we were dialing.
                        None => {
                            session_task.abort();
                            false
                        }
                    }
                };
                if !installed {
                    return;
                }

                tracing::info!("hub endpoint `{url}` connected");
                if let Some(attempts) = reconnect_attempt {
                    self.events.publish(GatewayEvent::ConnectionRecovered {
                        endpoint: url.to_string(),
                        attempts,
                    });
                }
                self.sync_tools().await;
            }
            Err(err) => {
                let message = err.to_string();
                let class = classify_error(&message);
                {
                    let mut status = status_handle.lock();
                    if let Some(attempt) = reconnect_attempt {
                        status.push_reconnect_record(attempt, false, Some(message.clone()));
                    }
                    status.record_failure(&message);
                    status.state = EndpointState::Disconnected;
                }
                tracing::warn!("hub endpoint `{url}` connect failed: {message}");
                self.publish_connection_error(url, &message, class);
                self.schedule_reconnect(url);
            }
        }
    }

    fn publish_connection_error(&self, url: &str, message: &str, class: ErrorClass) {
        self.events.publish(GatewayEvent::ConnectionError {
            endpoint: url.to_string(),
            error: message.to_string(),
            class: class.label().to_string(),
        });
        if class == ErrorClass::Authentication {
            self.events.publish(GatewayEvent::AuthenticationError {
                endpoint: url.to_string(),
                error: message.to_string(),
            });
        }
    }

    /// Schedule the next fixed-interval reconnect, unless the endpoint
    /// has exhausted its policy.
    fn schedule_reconnect(self: &Arc<Self>, url: &str) {
        if !self.is_running() {
            return;
        }
        let options = self.options.lock().clone();

        let mut map = self.endpoints.lock();
        let Some(entry) = map.get_mut(url) else {
            return;
        };

        {
            let mut status = entry.status.lock();
            if !status.may_reconnect(&options) {
                status.state = EndpointState::Failed;
                status.next_reconnect_at = None;
                tracing::warn!(
                    "hub endpoint `{url}` marked failed after {} attempt(s)",
                    status.reconnect_attempts
                );
                return;
            }
            let delay = chrono::Duration::milliseconds(options.reconnect_interval_ms as i64);
            status.state = EndpointState::Reconnecting;
            status.reconnect_delay_ms = options.reconnect_interval_ms;
            status.next_reconnect_at = Some(chrono::Utc::now() + delay);
        }

        if let Some(previous) = entry.reconnect_task.take() {
            previous.abort();
        }

        let manager = self.clone();
        let target = url.to_string();
        let delay = Duration::from_millis(options.reconnect_interval_ms);
        entry.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !manager.is_running() {
                return;
            }
            let attempt = {
                let map = manager.endpoints.lock();
                let Some(entry) = map.get(&target) else {
                    return;
                };
                let mut status = entry.status.lock();
                status.reconnect_attempts += 1;
                status.reconnect_attempts
            };
            manager.attempt_connect(&target, Some(attempt)).await;
        }));
    }

    /// Session task: owns the socket, multiplexes inbound JSON-RPC with
    /// outbound pushes and health pings.
    fn spawn_session(
        self: &Arc<Self>,
        url: &str,
        mut stream: websocket::WsStream,
        mut rx: mpsc::Receiver<SessionCommand>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let handler = self.handler.clone();
        let target = url.to_string();
        let batch_options = self.batch_options.lock().clone();

        tokio::spawn(async move {
            let mut batcher = MessageBatcher::new(batch_options);
            let mut pending_pong: Option<oneshot::Sender<()>> = None;
            let close_reason: String;

            loop {
                let flush_wait = if batcher.is_empty() {
                    Duration::from_secs(3600)
                } else {
                    batcher.timeout()
                };

                tokio::select! {
                    command = rx.recv() => match command {
                        Some(SessionCommand::Send(message)) => {
                            if let Some(batch) = batcher.push(message) {
                                let body = MessageBatcher::encode(&batch);
                                if stream.send(Message::Text(body.into())).await.is_err() {
                                    close_reason = "websocket write failed".to_string();
                                    break;
                                }
                            }
                        }
                        Some(SessionCommand::Ping(reply)) => {
                            pending_pong = Some(reply);
                            if stream.send(Message::Ping(Vec::new().into())).await.is_err() {
                                close_reason = "websocket ping failed".to_string();
                                break;
                            }
                        }
                        None => {
                            close_reason = "session handle dropped".to_string();
                            break;
                        }
                    },
                    _ = tokio::time::sleep(flush_wait), if !batcher.is_empty() => {
                        if let Some(batch) = batcher.flush() {
                            let body = MessageBatcher::encode(&batch);
                            if stream.send(Message::Text(body.into())).await.is_err() {
                                close_reason = "websocket write failed".to_string();
                                break;
                            }
                        }
                    },
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(response) = handler.handle_text(&text).await {
                                let body = match serde_json::to_string(&response) {
                                    Ok(body) => body,
                                    Err(err) => {
                                        tracing::error!("hub response serialization failed: {err}");
                                        continue;
                                    }
                                };
                                if stream.send(Message::Text(body.into())).await.is_err() {
                                    close_reason = "websocket write failed".to_string();
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if stream.send(Message::Pong(payload)).await.is_err() {
                                close_reason = "websocket pong failed".to_string();
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            if let Some(reply) = pending_pong.take() {
                                let _ = reply.send(());
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            close_reason = "hub closed the connection".to_string();
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            close_reason = format!("websocket error: {err}");
                            break;
                        }
                        None => {
                            close_reason = "websocket stream ended".to_string();
                            break;
                        }
                    },
                }
            }

            manager.on_session_closed(&target, &close_reason);
        })
    }

    fn on_session_closed(self: &Arc<Self>, url: &str, reason: &str) {
        if !self.is_running() {
            return;
        }
        let class = classify_error(reason);
        {
            let mut map = self.endpoints.lock();
            let Some(entry) = map.get_mut(url) else {
                return;
            };
            entry.session_tx = None;
            entry.session_task = None;
            let mut status = entry.status.lock();
            // A deliberate teardown already moved the state on.
            if status.state != EndpointState::Connected {
                return;
            }
            status.record_failure(reason);
            status.state = EndpointState::Disconnected;
            status.connected_at = None;
        }
        tracing::warn!("hub endpoint `{url}` dropped: {reason}");
        self.publish_connection_error(url, reason, class);
        self.schedule_reconnect(url);
    }

    // ── Background loops ───────────────────────────────────────────────

    fn spawn_loops(self: &Arc<Self>) {
        let mut loops = self.loops.lock();
        loops.push(self.spawn_health_loop());
        loops.push(self.spawn_idle_cleanup_loop());
        loops.push(self.spawn_memory_loop());
    }

    /// Probe every connected endpoint and apply the scoring rules; three
    /// consecutive failures force the session onto the reconnect path.
    fn spawn_health_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let (interval, enabled, probe_timeout) = {
                    let options = manager.options.lock();
                    (
                        Duration::from_millis(options.health_check_interval_ms),
                        options.health_check_enabled,
                        Duration::from_millis(options.connection_timeout_ms),
                    )
                };
                tokio::time::sleep(interval).await;
                if !enabled {
                    continue;
                }

                let targets: Vec<(String, mpsc::Sender<SessionCommand>, Arc<Mutex<EndpointStatus>>)> = manager
                    .endpoints
                    .lock()
                    .iter()
                    .filter(|(_, entry)| {
                        entry.status.lock().state == EndpointState::Connected
                    })
                    .filter_map(|(url, entry)| {
                        entry
                            .session_tx
                            .clone()
                            .map(|tx| (url.clone(), tx, entry.status.clone()))
                    })
                    .collect();

                for (url, tx, status) in targets {
                    let started = Instant::now();
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let sent = tx.send(SessionCommand::Ping(reply_tx)).await.is_ok();
                    let healthy = sent
                        && tokio::time::timeout(probe_timeout, reply_rx)
                            .await
                            .map(|r| r.is_ok())
                            .unwrap_or(false);

                    let failures = {
                        let mut status = status.lock();
                        if healthy {
                            status.record_success(started.elapsed().as_millis() as u64);
                            0
                        } else {
                            status.record_failure("health check timeout");
                            status.consecutive_failures
                        }
                    };

                    if failures >= 3 {
                        tracing::warn!(
                            "hub endpoint `{url}` failed {failures} health checks; reconnecting"
                        );
                        if let Some(entry) = manager.endpoints.lock().get_mut(&url) {
                            entry.teardown();
                            entry.status.lock().state = EndpointState::Disconnected;
                        }
                        manager.schedule_reconnect(&url);
                    }
                }
            }
        })
    }

    /// Backstop sweep: a session whose channel is gone while the status
    /// still says connected is treated as dropped.
    fn spawn_idle_cleanup_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = {
                    let options = manager.options.lock();
                    Duration::from_millis(options.connection_idle_timeout_ms)
                };
                tokio::time::sleep(interval).await;

                let stale: Vec<String> = manager
                    .endpoints
                    .lock()
                    .iter()
                    .filter(|(_, entry)| {
                        entry.status.lock().state == EndpointState::Connected
                            && entry
                                .session_tx
                                .as_ref()
                                .map(|tx| tx.is_closed())
                                .unwrap_or(true)
                    })
                    .map(|(url, _)| url.clone())
                    .collect();

                for url in stale {
                    manager.on_session_closed(&url, "session channel closed");
                }
            }
        })
    }

    /// Periodic memory pass: prune history and drop stale error strings
    /// on healthy endpoints.
    fn spawn_memory_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(MEMORY_OPTIMIZE_INTERVAL).await;
                let map = manager.endpoints.lock();
                for entry in map.values() {
                    let mut status = entry.status.lock();
                    while status.reconnect_history.len() > endpoint::RECONNECT_HISTORY_CAP {
                        status.reconnect_history.pop_front();
                    }
                    status.reconnect_history.shrink_to_fit();
                    if status.state == EndpointState::Connected {
                        status.last_error = None;
                        status.error_class = None;
                    }
                }
                tracing::debug!("hub memory pass over {} endpoint(s)", map.len());
            }
        })
    }
}

fn validate_endpoint_url(url: &str) -> Result<()> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        Err(GatewayError::Validation(format!(
            "hub endpoint `{url}` must be a ws:// or wss:// URL"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::ConfigStore;
    use crate::manager::ServiceManager;
    use crate::registry::ToolRegistry;
    use serde_json::Value;

    struct StaticTools(Vec<ToolDef>);

    impl ToolSource for StaticTools {
        fn tool_defs(&self) -> Vec<ToolDef> {
            self.0.clone()
        }
    }

    fn hub_manager(options: HubOptions) -> (tempfile::TempDir, Arc<HubConnectionManager>) {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigStore::load_from_dir(dir.path()).unwrap();
        let registry = ToolRegistry::new(config.clone());
        let cache = CacheStore::load_from_dir(dir.path());
        let manager = ServiceManager::new(config, registry, cache, EventBus::new());
        let handler = MessageHandler::new(manager);
        let tools = Arc::new(StaticTools(vec![ToolDef {
            name: "calc__add".into(),
            description: None,
            input_schema: serde_json::json!({"type": "object"}),
        }]));
        (
            dir,
            HubConnectionManager::new(handler, tools, options, EventBus::new()),
        )
    }

    fn fast_options() -> HubOptions {
        HubOptions {
            reconnect_interval_ms: 100,
            max_reconnect_attempts: 3,
            connection_timeout_ms: 500,
            health_check_enabled: false,
            ..Default::default()
        }
    }

    /// One-shot fake hub: accepts a single WebSocket client and forwards
    /// received text frames to the returned channel.
    async fn fake_hub() -> (String, mpsc::Receiver<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                if let Message::Text(text) = frame {
                    if tx.send(text.to_string()).await.is_err() {
                        break;
                    }
                }
            }
        });
        (format!("ws://{addr}"), rx)
    }

    #[test]
    fn initialize_seeds_disconnected_endpoints() {
        let (_dir, hub) = hub_manager(fast_options());
        hub.initialize(&["ws://a/mcp".into(), "ws://b/mcp".into()])
            .unwrap();

        let status = hub.status();
        assert_eq!(status.len(), 2);
        assert!(status
            .iter()
            .all(|s| s.state == EndpointState::Disconnected && s.health_score == 100));
    }

    #[test]
    fn initialize_rejects_non_ws_urls() {
        let (_dir, hub) = hub_manager(fast_options());
        assert!(matches!(
            hub.initialize(&["https://hub.example.com".into()]),
            Err(GatewayError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn connect_pushes_initial_tool_sync() {
        let (_dir, hub) = hub_manager(fast_options());
        let (url, mut inbox) = fake_hub().await;
        hub.initialize(&[url.clone()]).unwrap();
        hub.connect().await;

        let first = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        let parsed: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(parsed["method"], "notifications/tools/list_changed");
        assert_eq!(parsed["params"]["tools"][0]["name"], "calc__add");

        let status = hub.endpoint_status(&url).unwrap();
        assert_eq!(status.state, EndpointState::Connected);
        assert!(status.connected_at.is_some());

        hub.disconnect().await;
    }

    #[tokio::test]
    async fn reconnect_caps_and_marks_failed() {
        // Bind then drop a listener so the port is closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let (_dir, hub) = hub_manager(fast_options());
        hub.initialize(&[url.clone()]).unwrap();
        hub.connect().await;

        // 3 scheduled attempts at 100ms each, plus dial time.
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let status = hub.endpoint_status(&url).unwrap();
        assert_eq!(status.state, EndpointState::Failed);
        assert_eq!(status.reconnect_attempts, 3);
        assert_eq!(status.reconnect_history.len(), 3);
        assert!(status.reconnect_history.iter().all(|r| !r.success));
        assert!(status.next_reconnect_at.is_none());

        // No further timers: the counters stay put.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let later = hub.endpoint_status(&url).unwrap();
        assert_eq!(later.reconnect_attempts, 3);
        assert_eq!(later.reconnect_history.len(), 3);

        hub.disconnect().await;
    }

    #[tokio::test]
    async fn removed_endpoint_fires_no_more_timers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let (_dir, hub) = hub_manager(fast_options());
        hub.initialize(&[url.clone()]).unwrap();
        hub.connect().await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        hub.remove_endpoint(&url).unwrap();
        assert!(hub.endpoint_status(&url).is_none());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(hub.endpoint_status(&url).is_none());
        assert!(hub.status().is_empty());

        hub.disconnect().await;
    }

    #[tokio::test]
    async fn update_endpoints_removes_then_adds_keeping_survivors() {
        let (_dir, hub) = hub_manager(fast_options());
        hub.initialize(&["ws://keep/mcp".into(), "ws://old/mcp".into()])
            .unwrap();

        let (added, removed) = hub
            .update_endpoints(&["ws://keep/mcp".into(), "ws://new/mcp".into()])
            .await
            .unwrap();
        assert_eq!(added, vec!["ws://new/mcp".to_string()]);
        assert_eq!(removed, vec!["ws://old/mcp".to_string()]);

        let urls: Vec<String> = hub.status().iter().map(|s| s.endpoint_url.clone()).collect();
        assert_eq!(urls, vec!["ws://keep/mcp", "ws://new/mcp"]);
    }

    #[tokio::test]
    async fn reload_config_emits_config_change() {
        let (_dir, hub) = hub_manager(fast_options());
        hub.initialize(&["ws://old/mcp".into()]).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hub.events().subscribe(move |event, _| {
            if let GatewayEvent::ConfigChange { added, removed } = event {
                sink.lock().push((added.clone(), removed.clone()));
            }
        });

        hub.reload_config(Some(vec!["ws://new/mcp".into()]), Some(fast_options()))
            .await
            .unwrap();

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, vec!["ws://new/mcp".to_string()]);
        assert_eq!(events[0].1, vec!["ws://old/mcp".to_string()]);
    }

    #[tokio::test]
    async fn update_options_rejects_out_of_bounds() {
        let (_dir, hub) = hub_manager(fast_options());
        let mut options = fast_options();
        options.reconnect_interval_ms = 1;
        assert!(matches!(
            hub.update_options(options),
            Err(GatewayError::Validation(_))
        ));
        // The old options survive a rejected update.
        assert_eq!(hub.options.lock().reconnect_interval_ms, 100);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_stops_reconnects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let (_dir, hub) = hub_manager(fast_options());
        hub.initialize(&[url.clone()]).unwrap();
        hub.connect().await;
        hub.disconnect().await;
        hub.disconnect().await;

        let attempts_at_stop = hub.endpoint_status(&url).unwrap().reconnect_attempts;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            hub.endpoint_status(&url).unwrap().reconnect_attempts,
            attempts_at_stop
        );
    }

    #[tokio::test]
    async fn hub_requests_are_answered_over_the_session() {
        let (_dir, hub) = hub_manager(fast_options());

        // Fake hub that sends a tools/list request after accepting.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (reply_tx, mut reply_rx) = mpsc::channel::<String>(4);
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            ws.send(Message::Text(
                r#"{"jsonrpc":"2.0","id":41,"method":"tools/list"}"#.into(),
            ))
            .await
            .unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                if let Message::Text(text) = frame {
                    let _ = reply_tx.send(text.to_string()).await;
                }
            }
        });

        let url = format!("ws://{addr}");
        hub.initialize(&[url]).unwrap();
        hub.connect().await;

        // Skip the tool-sync push; find the response to id 41.
        let response = loop {
            let text = tokio::time::timeout(Duration::from_secs(2), reply_rx.recv())
                .await
                .unwrap()
                .unwrap();
            let parsed: Value = serde_json::from_str(&text).unwrap();
            if parsed.get("id") == Some(&Value::from(41)) {
                break parsed;
            }
        };
        assert!(response["result"]["tools"].is_array());

        hub.disconnect().await;
    }
}

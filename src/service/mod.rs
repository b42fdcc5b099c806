//! One upstream MCP service: connection lifecycle, tool map, ping loop.

pub mod http;
pub mod stdio;
pub mod transport;

pub use transport::{create_client, infer_transport, RequestOutcome, ServiceClient};

use crate::config::schema::ServiceConfig;
use crate::error::{GatewayError, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::protocol::{ToolDef, ToolsListResult, LATEST_PROTOCOL_VERSION};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Overall deadline for construct + handshake + first tool listing.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request deadline for handshake traffic inside the connect window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Disconnected,
    Connecting,
    Connected,
}

impl ServiceState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Point-in-time view of one service for status surfaces.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: String,
    pub initialized: bool,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A single upstream MCP server instance.
///
/// The service does not reconnect itself; the manager owns that policy.
pub struct McpService {
    name: String,
    config: ServiceConfig,
    state: RwLock<ServiceState>,
    initialized: AtomicBool,
    client: tokio::sync::RwLock<Option<Box<dyn ServiceClient>>>,
    tools: RwLock<HashMap<String, ToolDef>>,
    last_error: Mutex<Option<String>>,
    connect_attempts: AtomicU32,
    ping_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    events: EventBus,
}

impl McpService {
    pub fn new(name: &str, config: ServiceConfig, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            config,
            state: RwLock::new(ServiceState::Disconnected),
            initialized: AtomicBool::new(false),
            client: tokio::sync::RwLock::new(None),
            tools: RwLock::new(HashMap::new()),
            last_error: Mutex::new(None),
            connect_attempts: AtomicU32::new(0),
            ping_task: Mutex::new(None),
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ServiceState::Connected
    }

    /// Tools the service reported, keyed by their original names.
    pub fn tools(&self) -> Vec<ToolDef> {
        self.tools.read().values().cloned().collect()
    }

    pub fn has_tool(&self, original_name: &str) -> bool {
        self.tools.read().contains_key(original_name)
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            name: self.name.clone(),
            state: self.state().label().to_string(),
            initialized: self.initialized.load(Ordering::SeqCst),
            tool_count: self.tools.read().len(),
            last_error: self.last_error.lock().clone(),
        }
    }

    /// Connect, handshake, and list tools once. A service is `connected`
    /// only after the first successful tool listing.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        *self.state.write() = ServiceState::Connecting;
        *self.last_error.lock() = None;

        let outcome = tokio::time::timeout(CONNECT_TIMEOUT, self.establish()).await;
        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let error = match outcome {
            Ok(Ok(tool_count)) => {
                *self.state.write() = ServiceState::Connected;
                self.initialized.store(true, Ordering::SeqCst);
                tracing::info!(
                    "service `{}` connected; {tool_count} tool(s) available",
                    self.name
                );
                self.events.publish(GatewayEvent::ServiceConnected {
                    service: self.name.clone(),
                    tool_count,
                });
                self.start_ping_if_enabled();
                return Ok(());
            }
            Ok(Err(err)) => err,
            Err(_) => GatewayError::Timeout(CONNECT_TIMEOUT.as_millis() as u64),
        };

        // Release whatever was half-built before reporting failure.
        if let Some(client) = self.client.write().await.take() {
            let _ = client.close().await;
        }
        *self.state.write() = ServiceState::Disconnected;
        *self.last_error.lock() = Some(error.to_string());
        tracing::warn!(
            "service `{}` connect attempt {attempt} failed: {error}",
            self.name
        );
        self.events.publish(GatewayEvent::ServiceConnectionFailed {
            service: self.name.clone(),
            error: error.to_string(),
            attempt,
        });
        Err(error)
    }

    async fn establish(self: &Arc<Self>) -> Result<usize> {
        let client = create_client(&self.name, &self.config).await?;

        let init_result = client
            .request(
                "initialize",
                json!({
                    "protocolVersion": LATEST_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "xiaozhi-gateway",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
                HANDSHAKE_TIMEOUT,
            )
            .await?
            .into_reply()?;
        tracing::debug!(
            "service `{}` negotiated protocol {}",
            self.name,
            init_result
                .get("protocolVersion")
                .and_then(|v| v.as_str())
                .unwrap_or("?")
        );

        client
            .notify("notifications/initialized", json!({}))
            .await?;

        let listed = client
            .request("tools/list", json!({}), HANDSHAKE_TIMEOUT)
            .await?
            .into_reply()?;
        let tools: ToolsListResult = serde_json::from_value(listed).map_err(|e| {
            GatewayError::Upstream(format!("`{}` tools/list unparseable: {e}", self.name))
        })?;

        let tool_count = tools.tools.len();
        {
            let mut map = self.tools.write();
            map.clear();
            for tool in tools.tools {
                map.insert(tool.name.clone(), tool);
            }
        }
        *self.client.write().await = Some(client);
        Ok(tool_count)
    }

    /// Re-list tools on a live connection and refresh the tool map.
    pub async fn list_tools(&self) -> Result<Vec<ToolDef>> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected(self.name.clone()));
        }
        let guard = self.client.read().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| GatewayError::NotConnected(self.name.clone()))?;

        let listed = client
            .request("tools/list", json!({}), HANDSHAKE_TIMEOUT)
            .await?
            .into_reply()?;
        let tools: ToolsListResult = serde_json::from_value(listed).map_err(|e| {
            GatewayError::Upstream(format!("`{}` tools/list unparseable: {e}", self.name))
        })?;

        let mut map = self.tools.write();
        map.clear();
        for tool in &tools.tools {
            map.insert(tool.name.clone(), tool.clone());
        }
        Ok(tools.tools)
    }

    /// Invoke a tool by its original (un-namespaced) name.
    pub async fn call_tool(
        &self,
        original_name: &str,
        arguments: Value,
        timeout_override: Option<Duration>,
    ) -> Result<Value> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected(self.name.clone()));
        }
        if !self.has_tool(original_name) {
            return Err(GatewayError::NotFound(format!(
                "service `{}` has no tool `{original_name}`",
                self.name
            )));
        }

        let timeout =
            timeout_override.unwrap_or(Duration::from_millis(self.config.timeout_ms));
        let guard = self.client.read().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| GatewayError::NotConnected(self.name.clone()))?;

        client
            .request(
                "tools/call",
                json!({"name": original_name, "arguments": arguments}),
                timeout,
            )
            .await?
            .into_reply()
    }

    /// Tear down the connection. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.ping_task.lock().take() {
            handle.abort();
        }
        if let Some(client) = self.client.write().await.take() {
            let _ = client.close().await;
        }

        let was_connected = {
            let mut state = self.state.write();
            let was = *state == ServiceState::Connected;
            *state = ServiceState::Disconnected;
            was
        };
        self.initialized.store(false, Ordering::SeqCst);
        self.tools.write().clear();

        if was_connected {
            self.events.publish(GatewayEvent::ServiceDisconnected {
                service: self.name.clone(),
            });
        }
    }

    fn start_ping_if_enabled(self: &Arc<Self>) {
        let Some(ping) = self.config.ping.clone() else {
            return;
        };
        if !ping.enabled {
            return;
        }

        let service = Arc::downgrade(self);
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ping.start_delay_ms)).await;
            let mut ticker =
                tokio::time::interval(Duration::from_millis(ping.interval_ms.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(service) = service.upgrade() else {
                    break;
                };
                if !service.is_connected() {
                    break;
                }
                // A ping is a cheap tools/list; failure is logged, the
                // manager's health model owns any demotion.
                if let Err(err) = service.list_tools().await {
                    tracing::warn!("service `{name}` ping failed: {err}");
                }
            }
        });

        let previous = self.ping_task.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::PingConfig;

    /// Shell one-liner that answers the connect handshake: initialize
    /// (id 1), the initialized notification, then tools/list (id 2), then
    /// a tools/call (id 3), then blocks.
    fn mock_server_script() -> String {
        concat!(
            "read line; ",
            r#"printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"mock","version":"0.0.0"}}}\n'; "#,
            "read line; ",
            "read line; ",
            r#"printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"add","description":"Add two numbers","inputSchema":{"type":"object","properties":{"a":{"type":"number"},"b":{"type":"number"}},"required":["a","b"]}}]}}\n'; "#,
            "read line; ",
            r#"printf '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"5"}]}}\n'; "#,
            "cat >/dev/null",
        )
        .to_string()
    }

    fn mock_config() -> ServiceConfig {
        ServiceConfig {
            command: Some("sh".into()),
            args: vec!["-c".into(), mock_server_script()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn connect_populates_tools_and_state() {
        let service = McpService::new("calc", mock_config(), EventBus::new());
        assert_eq!(service.state(), ServiceState::Disconnected);

        service.connect().await.unwrap();
        assert!(service.is_connected());
        assert!(service.has_tool("add"));
        assert_eq!(service.tools().len(), 1);
        assert_eq!(service.status().state, "connected");

        service.disconnect().await;
        assert_eq!(service.state(), ServiceState::Disconnected);
        assert!(service.tools().is_empty());
    }

    #[tokio::test]
    async fn call_tool_roundtrip() {
        let service = McpService::new("calc", mock_config(), EventBus::new());
        service.connect().await.unwrap();

        let result = service
            .call_tool("add", json!({"a": 2, "b": 3}), None)
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "5");
        service.disconnect().await;
    }

    #[tokio::test]
    async fn call_tool_requires_connected_state() {
        let service = McpService::new("calc", mock_config(), EventBus::new());
        let err = service.call_tool("add", json!({}), None).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected(_)));
    }

    #[tokio::test]
    async fn call_tool_unknown_name_is_not_found() {
        let service = McpService::new("calc", mock_config(), EventBus::new());
        service.connect().await.unwrap();

        let err = service
            .call_tool("does_not_exist", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        service.disconnect().await;
    }

    #[tokio::test]
    async fn failed_connect_emits_event_and_resets_state() {
        let events = EventBus::new();
        let failures = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = failures.clone();
        events.subscribe(move |event, _| {
            if let GatewayEvent::ServiceConnectionFailed { attempt, .. } = event {
                sink.lock().push(*attempt);
            }
        });

        let config = ServiceConfig {
            command: Some("/usr/bin/this_binary_does_not_exist_xzgw_test".into()),
            ..Default::default()
        };
        let service = McpService::new("ghost", config, events);
        assert!(service.connect().await.is_err());
        assert!(service.connect().await.is_err());

        assert_eq!(service.state(), ServiceState::Disconnected);
        assert!(service.status().last_error.is_some());
        assert_eq!(*failures.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let service = McpService::new("calc", mock_config(), EventBus::new());
        service.connect().await.unwrap();
        service.disconnect().await;
        service.disconnect().await;
        assert_eq!(service.state(), ServiceState::Disconnected);
    }

    #[tokio::test]
    async fn ping_config_disabled_spawns_no_task() {
        let mut config = mock_config();
        config.ping = Some(PingConfig {
            enabled: false,
            ..Default::default()
        });
        let service = McpService::new("calc", config, EventBus::new());
        service.connect().await.unwrap();
        assert!(service.ping_task.lock().is_none());
        service.disconnect().await;
    }
}

//! Serde schema for `xiaozhi.config.json`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wire tag for the transport of an upstream MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl TransportKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable_http",
        }
    }
}

/// Liveness probing for one upstream service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ping_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_ping_start_delay_ms")]
    pub start_delay_ms: u64,
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_ping_start_delay_ms() -> u64 {
    5_000
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_ping_interval_ms(),
            start_delay_ms: default_ping_start_delay_ms(),
        }
    }
}

/// One upstream MCP server. The `type` tag may be absent; transport
/// inference fills it in from `command` / `url`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(rename = "apiKey", default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Per-call timeout for `tools/call` against this service.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingConfig>,
}

pub fn default_timeout_ms() -> u64 {
    8_000
}

/// How a user-defined (customMCP) tool is executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CustomToolHandler {
    /// Forward to another tool already in the public registry.
    Proxy { service: String, tool: String },
    /// POST the arguments to an external URL; body is the result.
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

/// A user-defined tool published under the reserved `customMCP` namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: serde_json::Value,
    pub handler: CustomToolHandler,
}

/// Persisted per-tool enable flag and usage counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUsageConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for ToolUsageConfig {
    fn default() -> Self {
        Self {
            enable: true,
            description: None,
            usage_count: 0,
            last_used_at: None,
        }
    }
}

/// Inbound adapter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Largest accepted request body on /mcp, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// SSE session inactivity timeout.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
}

fn default_http_port() -> u16 {
    9_880
}

fn default_max_clients() -> usize {
    32
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_session_timeout_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            max_clients: default_max_clients(),
            max_message_size: default_max_message_size(),
            session_timeout_ms: default_session_timeout_ms(),
        }
    }
}

/// Hub connection tuning, shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubOptions {
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub health_check_enabled: bool,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub connection_idle_timeout_ms: u64,
}

fn default_reconnect_interval_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connection_timeout_ms: default_connection_timeout_ms(),
            health_check_enabled: true,
            health_check_interval_ms: default_health_check_interval_ms(),
            connection_idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

/// Root of `xiaozhi.config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: HashMap<String, ServiceConfig>,
    #[serde(rename = "mcpEndpoints", default)]
    pub mcp_endpoints: Vec<String>,
    #[serde(rename = "customMCP", default, skip_serializing_if = "Vec::is_empty")]
    pub custom_mcp_tools: Vec<CustomTool>,
    /// service name -> tool name -> enable flag and usage stats.
    #[serde(rename = "mcpServerConfig", default)]
    pub server_tools: HashMap<String, HashMap<String, ToolUsageConfig>>,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(rename = "hub", default)]
    pub hub_options: HubOptions,
}

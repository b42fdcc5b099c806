//! The single JSON-RPC dispatcher behind every inbound adapter.
//!
//! `handle` takes a decoded message and returns the response to send, or
//! None for notifications. Adapters that receive raw text use
//! `handle_text`, which additionally covers parse errors.

use crate::cache::{result_key, ResultStatus};
use crate::config::schema::CustomToolHandler;
use crate::error::GatewayError;
use crate::manager::ServiceManager;
use crate::protocol::{
    negotiate_protocol_version, CallToolResult, JsonRpcResponse, INVALID_REQUEST, JSONRPC_VERSION,
    METHOD_NOT_FOUND, PARSE_ERROR,
};
use crate::registry::CUSTOM_NAMESPACE;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Long-running deadline for user-defined (customMCP) tools, which may
/// back workflow tasks.
const CUSTOM_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

pub struct MessageHandler {
    manager: Arc<ServiceManager>,
    http: reqwest::Client,
}

impl MessageHandler {
    pub fn new(manager: Arc<ServiceManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            http: reqwest::Client::new(),
        })
    }

    pub fn manager(&self) -> &Arc<ServiceManager> {
        &self.manager
    }

    /// Entry point for adapters that hold raw text (stdio lines, WS text
    /// frames). Malformed JSON yields a -32700 response.
    pub async fn handle_text(&self, raw: &str) -> Option<JsonRpcResponse> {
        match serde_json::from_str::<Value>(raw) {
            Ok(message) => self.handle(message).await,
            Err(err) => Some(JsonRpcResponse::error(
                None,
                PARSE_ERROR,
                format!("Parse error: {err}"),
            )),
        }
    }

    /// Dispatch one decoded JSON-RPC message.
    pub async fn handle(&self, message: Value) -> Option<JsonRpcResponse> {
        let (id, method, params) = match validate_envelope(&message) {
            Ok(parts) => parts,
            Err(response) => return Some(response),
        };
        let is_notification = id.is_none();

        let outcome = match method.as_str() {
            "initialize" => self.on_initialize(params),
            "notifications/initialized" => return None,
            "ping" => Ok(json!({})),
            "tools/list" => self.on_tools_list(),
            "tools/call" => self.on_tools_call(params).await,
            _ => {
                // Unknown notifications are dropped silently.
                if is_notification {
                    return None;
                }
                return Some(JsonRpcResponse::error(
                    id,
                    METHOD_NOT_FOUND,
                    format!("Method not found: {method}"),
                ));
            }
        };

        if is_notification {
            if let Err(err) = outcome {
                tracing::warn!("notification `{method}` failed: {err}");
            }
            return None;
        }

        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(err) => JsonRpcResponse::error(id, err.rpc_code(), err.to_string()),
        })
    }

    fn on_initialize(&self, params: Option<Value>) -> Result<Value, GatewayError> {
        let requested = params
            .as_ref()
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        Ok(json!({
            "protocolVersion": negotiate_protocol_version(requested),
            "capabilities": {"tools": {}},
            "serverInfo": {
                "name": "xiaozhi-gateway",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }))
    }

    fn on_tools_list(&self) -> Result<Value, GatewayError> {
        Ok(json!({"tools": self.manager.tool_defs()}))
    }

    async fn on_tools_call(&self, params: Option<Value>) -> Result<Value, GatewayError> {
        let params = params
            .ok_or_else(|| GatewayError::Validation("tools/call requires params".into()))?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Validation("tools/call requires a string name".into()))?
            .to_string();
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let descriptor = self.manager.lookup_enabled(&name)?;
        if let Err(reason) = validate_arguments(&descriptor.input_schema, &arguments) {
            return Err(GatewayError::Upstream(format!(
                "invalid arguments for `{name}`: {reason}"
            )));
        }

        if descriptor.service_name == CUSTOM_NAMESPACE {
            self.call_custom_tool(&descriptor.original_name, arguments)
                .await
        } else {
            self.manager.call_tool(&name, arguments, None).await
        }
    }

    /// Execute a user-defined tool with the long-running timeout.
    ///
    /// Runs flow through the result cache as workflow tasks: a pending
    /// entry with a task id is written before dispatch, completion
    /// overwrites it in place, and a failure transitions it through
    /// `update_status`. Calling again with the same arguments polls the
    /// cache first: a finished result is delivered and marked consumed,
    /// an in-flight run is reported instead of dispatched twice, and a
    /// failed run is re-dispatched with a bumped retry counter.
    async fn call_custom_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<Value, GatewayError> {
        let tool = self
            .manager
            .config_store()
            .custom_mcp_tools()
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown custom tool `{name}`")))?;

        let cache = self.manager.cache();
        let key = result_key(name, &arguments);

        let mut retry_count = 0;
        if let Some(entry) = cache.read_result(name, &arguments) {
            match entry.status {
                ResultStatus::Completed => {
                    if let Err(err) = cache.mark_consumed(&key).await {
                        tracing::warn!("failed to consume cached result for `{name}`: {err}");
                    }
                    return Ok(entry.result);
                }
                ResultStatus::Pending => {
                    let task = entry.task_id.unwrap_or_else(|| "unknown".to_string());
                    return Ok(serde_json::to_value(CallToolResult::text(format!(
                        "task `{task}` is still running; call again to poll for its result"
                    )))?);
                }
                ResultStatus::Failed => retry_count = entry.retry_count + 1,
            }
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        // Cache trouble must not block the call itself.
        if let Err(err) = cache
            .write_result(
                name,
                &arguments,
                Value::Null,
                ResultStatus::Pending,
                None,
                Some(task_id.clone()),
                retry_count,
            )
            .await
        {
            tracing::warn!("pending result write for `{name}` failed: {err}");
        }

        let outcome = match &tool.handler {
            CustomToolHandler::Proxy { service, tool } => {
                let target = crate::registry::public_tool_name(service, tool);
                self.manager
                    .call_tool(&target, arguments.clone(), Some(CUSTOM_TOOL_TIMEOUT))
                    .await
            }
            CustomToolHandler::Http { url, headers } => {
                self.call_http_tool(url, headers, &arguments).await
            }
        };

        match &outcome {
            Ok(result) => {
                // Completion overwrites the pending entry in place, so a
                // poller that lost this reply can still collect it before
                // the TTL runs out.
                if let Err(err) = cache
                    .write_result(
                        name,
                        &arguments,
                        result.clone(),
                        ResultStatus::Completed,
                        None,
                        Some(task_id),
                        retry_count,
                    )
                    .await
                {
                    tracing::warn!("result cache write for `{name}` failed: {err}");
                }
            }
            Err(error) => {
                tracing::warn!("custom tool `{name}` failed: {error}");
                if let Err(err) = cache.update_status(&key, ResultStatus::Failed).await {
                    tracing::warn!("result status update for `{name}` failed: {err}");
                }
            }
        }
        outcome
    }

    async fn call_http_tool(
        &self,
        url: &str,
        headers: &std::collections::HashMap<String, String>,
        arguments: &Value,
    ) -> Result<Value, GatewayError> {
        let mut request = self
            .http
            .post(url)
            .timeout(CUSTOM_TOOL_TIMEOUT)
            .json(arguments);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(CUSTOM_TOOL_TIMEOUT.as_millis() as u64)
            } else {
                GatewayError::Transport(format!("custom tool POST failed: {e}"))
            }
        })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(format!("custom tool body unreadable: {e}")))?;
        if !status.is_success() {
            return Err(GatewayError::Upstream(format!(
                "custom tool returned HTTP {status}: {body}"
            )));
        }
        Ok(serde_json::to_value(CallToolResult::text(body))?)
    }
}

/// Check the JSON-RPC 2.0 envelope. On success returns (id, method,
/// params); on failure the ready-made -32600 response.
fn validate_envelope(
    message: &Value,
) -> Result<(Option<Value>, String, Option<Value>), JsonRpcResponse> {
    let invalid = |id: Option<Value>, detail: &str| {
        Err(JsonRpcResponse::error(
            id,
            INVALID_REQUEST,
            format!("Invalid Request: {detail}"),
        ))
    };

    let Some(obj) = message.as_object() else {
        return invalid(None, "message is not an object");
    };

    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(id @ Value::String(_)) | Some(id @ Value::Number(_)) => Some(id.clone()),
        Some(_) => return invalid(None, "id must be a string or number"),
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return invalid(id, "jsonrpc must be \"2.0\"");
    }

    let method = match obj.get("method").and_then(Value::as_str) {
        Some(method) if !method.is_empty() => method.to_string(),
        _ => return invalid(id, "method must be a non-empty string"),
    };

    let params = match obj.get("params") {
        None | Some(Value::Null) => None,
        Some(params @ Value::Object(_)) => Some(params.clone()),
        Some(_) => return invalid(id, "params must be an object"),
    };

    Ok((id, method, params))
}

/// Minimal JSON-Schema enforcement for tool arguments: the `required`
/// list and per-property primitive `type` tags of object schemas.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };
    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return Ok(());
    }

    let args = arguments
        .as_object()
        .ok_or_else(|| "arguments must be an object".to_string())?;

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(name) {
                return Err(format!("missing required property `{name}`"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, value) in args {
            let Some(expected) = properties
                .get(name)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if !value_matches_type(value, expected) {
                return Err(format!("property `{name}` is not of type `{expected}`"));
            }
        }
    }
    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

//! Service manager: owns every upstream service instance and its config.

use crate::cache::CacheStore;
use crate::config::schema::ServiceConfig;
use crate::config::ConfigStore;
use crate::error::{GatewayError, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::protocol::ToolDef;
use crate::registry::{ToolDescriptor, ToolFilter, ToolRegistry, ToolSortKey, CUSTOM_NAMESPACE};
use crate::service::transport::infer_transport;
use crate::service::{McpService, ServiceStatus};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const SERVICE_NAME_MAX_LEN: usize = 50;

/// Check a service name against `^[A-Za-z0-9_-]{1,50}$`.
pub fn validate_service_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= SERVICE_NAME_MAX_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(GatewayError::Validation(format!(
            "invalid service name `{name}` (want 1-50 chars of [A-Za-z0-9_-])"
        )))
    }
}

/// Outcome of a batch add: which candidates connected, which failed and why.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AddReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedAdd>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FailedAdd {
    pub name: String,
    pub error: String,
}

/// Aggregate status for the /status surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManagerStatus {
    pub services: Vec<ServiceStatus>,
    pub connected: usize,
    pub total_tools: usize,
}

pub struct ServiceManager {
    services: tokio::sync::RwLock<HashMap<String, Arc<McpService>>>,
    config: ConfigStore,
    registry: ToolRegistry,
    cache: CacheStore,
    events: EventBus,
}

impl ServiceManager {
    pub fn new(
        config: ConfigStore,
        registry: ToolRegistry,
        cache: CacheStore,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            services: tokio::sync::RwLock::new(HashMap::new()),
            config,
            registry,
            cache,
            events,
        })
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Publish the user-defined customMCP tools into the registry.
    pub fn sync_custom_tools(&self) {
        let defs: Vec<ToolDef> = self
            .config
            .custom_mcp_tools()
            .into_iter()
            .map(|tool| ToolDef {
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
            })
            .collect();
        if !defs.is_empty() {
            self.registry
                .register_service_tools(CUSTOM_NAMESPACE, &defs);
            self.events.publish(GatewayEvent::ServerToolsUpdated {
                name: CUSTOM_NAMESPACE.to_string(),
                tool_count: defs.len(),
            });
        }
    }

    /// Connect every configured service. Individual failures are logged
    /// and skipped, never fatal to startup.
    pub async fn start_all(self: &Arc<Self>) {
        self.sync_custom_tools();
        for (name, _) in self.config.mcp_servers() {
            if let Err(err) = self.start_service(&name).await {
                tracing::error!("failed to start MCP service `{name}`: {err}");
            }
        }
    }

    /// Disconnect everything. Idempotent.
    pub async fn stop_all(&self) {
        let services: Vec<Arc<McpService>> =
            self.services.read().await.values().cloned().collect();
        for service in services {
            self.registry.unregister_service(service.name());
            service.disconnect().await;
        }
    }

    /// Create (if needed) and connect one configured service, then publish
    /// its tools and refresh the tool cache.
    pub async fn start_service(self: &Arc<Self>, name: &str) -> Result<()> {
        let config = self
            .config
            .mcp_servers()
            .remove(name)
            .ok_or_else(|| GatewayError::NotFound(format!("service `{name}` is not configured")))?;

        let service = {
            let mut services = self.services.write().await;
            services
                .entry(name.to_string())
                .or_insert_with(|| McpService::new(name, config.clone(), self.events.clone()))
                .clone()
        };

        service.connect().await?;

        let tools = service.tools();
        self.registry.register_service_tools(name, &tools);
        self.events.publish(GatewayEvent::ServerToolsUpdated {
            name: name.to_string(),
            tool_count: tools.len(),
        });
        self.events.publish(GatewayEvent::ServerStatusChanged {
            name: name.to_string(),
            status: "connected".to_string(),
        });

        // Cache refresh is best-effort; a disk failure must not undo a
        // successful connect.
        if let Err(err) = self.cache.write_cache_entry(name, &tools, &config).await {
            tracing::warn!("tool cache write for `{name}` failed: {err}");
        }
        Ok(())
    }

    pub async fn stop_service(&self, name: &str) -> Result<()> {
        let service = self
            .services
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("service `{name}` is not running")))?;

        self.registry.unregister_service(name);
        service.disconnect().await;
        self.events.publish(GatewayEvent::ServerStatusChanged {
            name: name.to_string(),
            status: "disconnected".to_string(),
        });
        Ok(())
    }

    pub async fn restart_service(self: &Arc<Self>, name: &str) -> Result<()> {
        self.events.publish(GatewayEvent::ServiceRestartRequested {
            service: name.to_string(),
        });
        if let Some(service) = self.services.read().await.get(name).cloned() {
            self.registry.unregister_service(name);
            service.disconnect().await;
        }
        self.start_service(name).await
    }

    /// Add a batch of service configs. All candidates are validated first;
    /// one bad candidate rejects the whole batch. Candidates are then
    /// persisted and connected one by one. When none connect, everything
    /// is rolled back and the add fails.
    pub async fn add_service_configs(
        self: &Arc<Self>,
        batch: Vec<(String, ServiceConfig)>,
    ) -> Result<AddReport> {
        if batch.is_empty() {
            return Err(GatewayError::Validation("empty service batch".into()));
        }

        let existing = self.config.mcp_servers();
        for (name, config) in &batch {
            validate_service_name(name)?;
            infer_transport(name, config)?;
            if existing.contains_key(name) {
                return Err(GatewayError::Conflict(format!(
                    "service `{name}` already exists"
                )));
            }
        }
        {
            let mut seen = std::collections::HashSet::new();
            for (name, _) in &batch {
                if !seen.insert(name.as_str()) {
                    return Err(GatewayError::Conflict(format!(
                        "service `{name}` appears twice in the batch"
                    )));
                }
            }
        }

        let mut report = AddReport::default();
        for (name, config) in &batch {
            if let Err(err) = self.config.add_service(name, config.clone()) {
                report.failed.push(FailedAdd {
                    name: name.clone(),
                    error: err.to_string(),
                });
                continue;
            }
            self.events.publish(GatewayEvent::ServerAdded { name: name.clone() });

            match self.start_service(name).await {
                Ok(()) => report.succeeded.push(name.clone()),
                Err(err) => report.failed.push(FailedAdd {
                    name: name.clone(),
                    error: err.to_string(),
                }),
            }
        }

        if report.succeeded.is_empty() {
            for (name, _) in &batch {
                let _ = self.remove_service_config(name).await;
            }
            let detail: Vec<String> = report
                .failed
                .iter()
                .map(|f| format!("{}: {}", f.name, f.error))
                .collect();
            return Err(GatewayError::Internal(format!(
                "ADD_FAILED: no service in the batch could start ({})",
                detail.join("; ")
            )));
        }
        Ok(report)
    }

    pub async fn update_service_config(
        self: &Arc<Self>,
        name: &str,
        config: ServiceConfig,
    ) -> Result<()> {
        if !self.config.mcp_servers().contains_key(name) {
            return Err(GatewayError::NotFound(format!(
                "service `{name}` is not configured"
            )));
        }
        infer_transport(name, &config)?;
        self.config
            .update_service(name, config.clone())
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        // Replace the live instance so the new config takes effect.
        if let Some(service) = self.services.write().await.remove(name) {
            self.registry.unregister_service(name);
            service.disconnect().await;
        }
        self.start_service(name).await
    }

    pub async fn remove_service_config(&self, name: &str) -> Result<()> {
        if let Some(service) = self.services.write().await.remove(name) {
            self.registry.unregister_service(name);
            service.disconnect().await;
        }
        self.config
            .remove_service(name)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        if let Err(err) = self.cache.remove_service(name).await {
            tracing::warn!("tool cache cleanup for `{name}` failed: {err}");
        }
        self.events
            .publish(GatewayEvent::ServerRemoved { name: name.to_string() });
        Ok(())
    }

    /// Route a `tools/call` to the owning service by public name.
    ///
    /// customMCP tools are executed by the message handler, not here.
    pub async fn call_tool(
        &self,
        public_name: &str,
        arguments: Value,
        timeout_override: Option<Duration>,
    ) -> Result<Value> {
        let descriptor = self.lookup_enabled(public_name)?;
        if descriptor.service_name == CUSTOM_NAMESPACE {
            return Err(GatewayError::Validation(format!(
                "tool `{public_name}` belongs to the customMCP namespace"
            )));
        }

        let service = self
            .services
            .read()
            .await
            .get(&descriptor.service_name)
            .cloned()
            .ok_or_else(|| {
                GatewayError::NotConnected(descriptor.service_name.clone())
            })?;

        let result = service
            .call_tool(&descriptor.original_name, arguments, timeout_override)
            .await?;
        self.registry.record_usage(public_name);
        Ok(result)
    }

    pub fn lookup_enabled(&self, public_name: &str) -> Result<ToolDescriptor> {
        let descriptor = self
            .registry
            .lookup(public_name)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown tool `{public_name}`")))?;
        if !descriptor.enabled {
            return Err(GatewayError::NotFound(format!(
                "tool `{public_name}` is disabled"
            )));
        }
        Ok(descriptor)
    }

    pub fn get_all_tools(&self, filter: ToolFilter, sort: ToolSortKey) -> Vec<ToolDescriptor> {
        self.registry.list(filter, sort)
    }

    /// Enabled tools, as served to `tools/list` callers and hub sessions.
    pub fn tool_defs(&self) -> Vec<ToolDef> {
        self.registry.enabled_tool_defs()
    }

    pub async fn get_status(&self) -> ManagerStatus {
        let services = self.services.read().await;
        let mut statuses: Vec<ServiceStatus> =
            services.values().map(|s| s.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        let connected = statuses.iter().filter(|s| s.state == "connected").count();
        ManagerStatus {
            connected,
            total_tools: self.registry.len(),
            services: statuses,
        }
    }

    pub async fn service(&self, name: &str) -> Option<Arc<McpService>> {
        self.services.read().await.get(name).cloned()
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mock_server_script() -> String {
        concat!(
            "read line; ",
            r#"printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"mock","version":"0.0.0"}}}\n'; "#,
            "read line; ",
            "read line; ",
            r#"printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"add","description":"Add","inputSchema":{"type":"object"}}]}}\n'; "#,
            "read line; ",
            r#"printf '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"5"}]}}\n'; "#,
            "cat >/dev/null",
        )
        .to_string()
    }

    fn stdio_config() -> ServiceConfig {
        ServiceConfig {
            command: Some("sh".into()),
            args: vec!["-c".into(), mock_server_script()],
            ..Default::default()
        }
    }

    fn manager() -> (tempfile::TempDir, Arc<ServiceManager>) {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigStore::load_from_dir(dir.path()).unwrap();
        let registry = ToolRegistry::new(config.clone());
        let cache = CacheStore::load_from_dir(dir.path());
        let events = EventBus::new();
        (dir, ServiceManager::new(config, registry, cache, events))
    }

    #[test]
    fn service_name_boundaries() {
        assert!(validate_service_name("").is_err());
        assert!(validate_service_name("a").is_ok());
        assert!(validate_service_name(&"a".repeat(50)).is_ok());
        assert!(validate_service_name(&"a".repeat(51)).is_err());
        assert!(validate_service_name("calc-v2_test").is_ok());
        assert!(validate_service_name("calc server").is_err());
        assert!(validate_service_name("calc/x").is_err());
    }

    #[tokio::test]
    async fn add_start_call_remove_roundtrip() {
        let (_dir, manager) = manager();

        let report = manager
            .add_service_configs(vec![("calc".into(), stdio_config())])
            .await
            .unwrap();
        assert_eq!(report.succeeded, vec!["calc".to_string()]);
        assert!(report.failed.is_empty());

        let tools = manager.tool_defs();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "calc__add");

        let result = manager
            .call_tool("calc__add", json!({"a": 2, "b": 3}), None)
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "5");
        assert_eq!(
            manager.registry().lookup("calc__add").unwrap().usage_count,
            1
        );

        manager.remove_service_config("calc").await.unwrap();
        assert!(manager.tool_defs().is_empty());
        assert!(manager.config_store().mcp_servers().is_empty());
    }

    #[tokio::test]
    async fn add_remove_restores_manager_state() {
        let (_dir, manager) = manager();
        let before_services = manager.config_store().mcp_servers();
        let before_tools = manager.tool_defs();

        manager
            .add_service_configs(vec![("calc".into(), stdio_config())])
            .await
            .unwrap();
        manager.remove_service_config("calc").await.unwrap();

        assert_eq!(manager.config_store().mcp_servers(), before_services);
        assert_eq!(manager.tool_defs().len(), before_tools.len());
        assert!(manager.service("calc").await.is_none());
    }

    #[tokio::test]
    async fn batch_rejected_when_any_name_invalid() {
        let (_dir, manager) = manager();
        let err = manager
            .add_service_configs(vec![
                ("ok-name".into(), stdio_config()),
                ("bad name".into(), stdio_config()),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        // Nothing persisted from the rejected batch.
        assert!(manager.config_store().mcp_servers().is_empty());
    }

    #[tokio::test]
    async fn batch_rejected_on_duplicate_existing_name() {
        let (_dir, manager) = manager();
        manager
            .add_service_configs(vec![("calc".into(), stdio_config())])
            .await
            .unwrap();

        let err = manager
            .add_service_configs(vec![("calc".into(), stdio_config())])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn batch_with_zero_successes_rolls_back() {
        let (_dir, manager) = manager();
        let broken = ServiceConfig {
            command: Some("/usr/bin/this_binary_does_not_exist_xzgw_test".into()),
            ..Default::default()
        };

        let err = manager
            .add_service_configs(vec![("ghost".into(), broken)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ADD_FAILED"));
        assert!(manager.config_store().mcp_servers().is_empty());
        assert!(manager.service("ghost").await.is_none());
    }

    #[tokio::test]
    async fn partial_success_reports_failures_and_keeps_winners() {
        let (_dir, manager) = manager();
        let broken = ServiceConfig {
            command: Some("/usr/bin/this_binary_does_not_exist_xzgw_test".into()),
            ..Default::default()
        };

        let report = manager
            .add_service_configs(vec![
                ("calc".into(), stdio_config()),
                ("ghost".into(), broken),
            ])
            .await
            .unwrap();
        assert_eq!(report.succeeded, vec!["calc".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].name, "ghost");
        assert!(manager.service("calc").await.unwrap().is_connected());
    }

    #[tokio::test]
    async fn tool_cache_written_after_connect() {
        let (dir, manager) = manager();
        manager
            .add_service_configs(vec![("calc".into(), stdio_config())])
            .await
            .unwrap();

        let cache = CacheStore::load_from_dir(dir.path());
        let cached = cache.cached_tools("calc").unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].name, "add");
    }

    #[tokio::test]
    async fn call_tool_unknown_name_not_found() {
        let (_dir, manager) = manager();
        let err = manager
            .call_tool("nope__tool", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn status_counts_connected_services() {
        let (_dir, manager) = manager();
        manager
            .add_service_configs(vec![("calc".into(), stdio_config())])
            .await
            .unwrap();

        let status = manager.get_status().await;
        assert_eq!(status.connected, 1);
        assert_eq!(status.total_tools, 1);
        assert_eq!(status.services[0].name, "calc");
    }
}

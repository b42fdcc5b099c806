//! Aggregated tool registry.
//!
//! Maps public tool names to their owning service. Public names are
//! `{service}__{tool}` except in the reserved `customMCP` namespace, where
//! the user-defined name is published as-is. Enable flags and usage
//! counters are persisted through the config collaborator.

use crate::config::ConfigStore;
use crate::error::{GatewayError, Result};
use crate::protocol::ToolDef;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Reserved namespace for user-defined tools.
pub const CUSTOM_NAMESPACE: &str = "customMCP";

/// One entry in the public registry.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
    pub service_name: String,
    pub original_name: String,
    pub enabled: bool,
    pub usage_count: u64,
    pub last_used_at: Option<String>,
}

/// Listing filter on the enable flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolFilter {
    #[default]
    All,
    Enabled,
    Disabled,
}

impl ToolFilter {
    pub fn parse(input: &str) -> Result<Self> {
        match input {
            "all" => Ok(Self::All),
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            other => Err(GatewayError::Validation(format!(
                "unknown tool filter `{other}`"
            ))),
        }
    }

    fn matches(&self, descriptor: &ToolDescriptor) -> bool {
        match self {
            Self::All => true,
            Self::Enabled => descriptor.enabled,
            Self::Disabled => !descriptor.enabled,
        }
    }
}

/// Listing sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolSortKey {
    #[default]
    Name,
    Enabled,
    UsageCount,
    LastUsedTime,
}

impl ToolSortKey {
    pub fn parse(input: &str) -> Result<Self> {
        match input {
            "name" => Ok(Self::Name),
            "enabled" => Ok(Self::Enabled),
            "usageCount" => Ok(Self::UsageCount),
            "lastUsedTime" => Ok(Self::LastUsedTime),
            other => Err(GatewayError::Validation(format!(
                "unknown sort field `{other}`"
            ))),
        }
    }
}

/// Compose the public name for a service's tool.
pub fn public_tool_name(service: &str, tool: &str) -> String {
    if service == CUSTOM_NAMESPACE {
        tool.to_string()
    } else {
        format!("{service}__{tool}")
    }
}

/// Shared registry handle.
#[derive(Clone)]
pub struct ToolRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    tools: RwLock<HashMap<String, ToolDescriptor>>,
    config: ConfigStore,
}

impl ToolRegistry {
    pub fn new(config: ConfigStore) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tools: RwLock::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Replace a service's tools in the registry. Colliding public names
    /// are overwritten; the later registration wins.
    pub fn register_service_tools(&self, service: &str, tools: &[ToolDef]) {
        let mut map = self.inner.tools.write();
        map.retain(|_, d| d.service_name != service);

        for tool in tools {
            let public = public_tool_name(service, &tool.name);
            let usage = self
                .inner
                .config
                .server_tools_config(service)
                .remove(&tool.name);

            if map.contains_key(&public) {
                tracing::warn!(
                    "tool `{public}` already registered; `{service}` overwrites the earlier owner"
                );
            }

            let (enabled, usage_count, last_used_at) = match usage {
                Some(entry) => (entry.enable, entry.usage_count, entry.last_used_at),
                None => (true, 0, None),
            };

            map.insert(
                public.clone(),
                ToolDescriptor {
                    name: public,
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                    service_name: service.to_string(),
                    original_name: tool.name.clone(),
                    enabled,
                    usage_count,
                    last_used_at,
                },
            );
        }
    }

    /// Drop every entry owned by `service`.
    pub fn unregister_service(&self, service: &str) {
        self.inner
            .tools
            .write()
            .retain(|_, d| d.service_name != service);
    }

    pub fn lookup(&self, public_name: &str) -> Option<ToolDescriptor> {
        self.inner.tools.read().get(public_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tools.read().is_empty()
    }

    /// Filtered, sorted listing for admin surfaces.
    pub fn list(&self, filter: ToolFilter, sort: ToolSortKey) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .inner
            .tools
            .read()
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();

        match sort {
            ToolSortKey::Name => tools.sort_by(|a, b| a.name.cmp(&b.name)),
            ToolSortKey::Enabled => {
                tools.sort_by(|a, b| b.enabled.cmp(&a.enabled).then(a.name.cmp(&b.name)))
            }
            ToolSortKey::UsageCount => tools.sort_by(|a, b| {
                b.usage_count
                    .cmp(&a.usage_count)
                    .then(a.name.cmp(&b.name))
            }),
            ToolSortKey::LastUsedTime => tools.sort_by(|a, b| {
                b.last_used_at
                    .cmp(&a.last_used_at)
                    .then(a.name.cmp(&b.name))
            }),
        }
        tools
    }

    /// The enabled-tool snapshot served to `tools/list` callers.
    pub fn enabled_tool_defs(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self
            .inner
            .tools
            .read()
            .values()
            .filter(|d| d.enabled)
            .map(|d| ToolDef {
                name: d.name.clone(),
                description: d.description.clone(),
                input_schema: d.input_schema.clone(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Bump in-memory and persisted usage counters after a dispatch.
    pub fn record_usage(&self, public_name: &str) {
        let now = Utc::now().to_rfc3339();
        let persisted = {
            let mut map = self.inner.tools.write();
            match map.get_mut(public_name) {
                Some(descriptor) => {
                    descriptor.usage_count += 1;
                    descriptor.last_used_at = Some(now.clone());
                    Some((descriptor.service_name.clone(), descriptor.original_name.clone()))
                }
                None => None,
            }
        };

        // Write-through is best-effort; a config write failure must not
        // fail the tool call itself.
        if let Some((service, tool)) = persisted {
            if let Err(err) = self.inner.config.record_tool_usage(&service, &tool, now) {
                tracing::warn!("failed to persist usage for `{public_name}`: {err}");
            }
        }
    }

    pub fn set_enabled(&self, public_name: &str, enabled: bool) -> Result<()> {
        let (service, tool) = {
            let mut map = self.inner.tools.write();
            let descriptor = map.get_mut(public_name).ok_or_else(|| {
                GatewayError::NotFound(format!("tool `{public_name}` is not registered"))
            })?;
            descriptor.enabled = enabled;
            (descriptor.service_name.clone(), descriptor.original_name.clone())
        };

        self.inner
            .config
            .set_tool_enabled(&service, &tool, enabled, None)
            .map_err(|err| GatewayError::Internal(err.to_string()))
    }
}

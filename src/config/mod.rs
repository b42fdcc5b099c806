//! Configuration collaborator.
//!
//! Owns `xiaozhi.config.json` in the directory selected by
//! `XIAOZHI_CONFIG_DIR` (defaulting to the working directory). Mutations
//! write through to disk with the same temp-file + rename discipline the
//! cache uses, so a crash never leaves a torn config behind.

pub mod schema;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use schema::{
    AppConfig, CustomTool, CustomToolHandler, GatewaySettings, HubOptions, PingConfig,
    ServiceConfig, ToolUsageConfig, TransportKind,
};

pub const CONFIG_DIR_ENV: &str = "XIAOZHI_CONFIG_DIR";
pub const CONFIG_FILE_NAME: &str = "xiaozhi.config.json";
pub const CACHE_FILE_NAME: &str = "xiaozhi.cache.json";

/// Resolve the configuration directory from the environment.
pub fn config_dir() -> PathBuf {
    match std::env::var_os(CONFIG_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

/// Shared, write-through view of the configuration file.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<ConfigStoreInner>,
}

struct ConfigStoreInner {
    path: PathBuf,
    config: RwLock<AppConfig>,
}

impl ConfigStore {
    /// Load from `dir/xiaozhi.config.json`, starting empty when the file
    /// does not exist yet.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config at {}", path.display()))?
        } else {
            AppConfig::default()
        };

        Ok(Self {
            inner: Arc::new(ConfigStoreInner {
                path,
                config: RwLock::new(config),
            }),
        })
    }

    /// In-memory store for tests and embedding; `save` becomes a no-op
    /// target path under the given directory.
    pub fn from_config(dir: &Path, config: AppConfig) -> Self {
        Self {
            inner: Arc::new(ConfigStoreInner {
                path: dir.join(CONFIG_FILE_NAME),
                config: RwLock::new(config),
            }),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.inner.path
    }

    pub fn config_exists(&self) -> bool {
        self.inner.path.exists()
    }

    // ── Read accessors ─────────────────────────────────────────────────

    pub fn mcp_servers(&self) -> HashMap<String, ServiceConfig> {
        self.inner.config.read().mcp_servers.clone()
    }

    pub fn mcp_endpoints(&self) -> Vec<String> {
        self.inner.config.read().mcp_endpoints.clone()
    }

    pub fn custom_mcp_tools(&self) -> Vec<CustomTool> {
        self.inner.config.read().custom_mcp_tools.clone()
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        self.inner.config.read().gateway.clone()
    }

    pub fn hub_options(&self) -> HubOptions {
        self.inner.config.read().hub_options.clone()
    }

    pub fn server_tools_config(&self, service: &str) -> HashMap<String, ToolUsageConfig> {
        self.inner
            .config
            .read()
            .server_tools
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    /// A tool defaults to enabled until explicitly disabled.
    pub fn is_tool_enabled(&self, service: &str, tool: &str) -> bool {
        self.inner
            .config
            .read()
            .server_tools
            .get(service)
            .and_then(|tools| tools.get(tool))
            .map(|entry| entry.enable)
            .unwrap_or(true)
    }

    // ── Write-through mutations ────────────────────────────────────────

    pub fn update_server_tools_config(
        &self,
        service: &str,
        tools: HashMap<String, ToolUsageConfig>,
    ) -> Result<()> {
        self.mutate(|config| {
            config.server_tools.insert(service.to_string(), tools.clone());
        })
    }

    pub fn set_tool_enabled(
        &self,
        service: &str,
        tool: &str,
        enabled: bool,
        description: Option<String>,
    ) -> Result<()> {
        self.mutate(|config| {
            let entry = config
                .server_tools
                .entry(service.to_string())
                .or_default()
                .entry(tool.to_string())
                .or_default();
            entry.enable = enabled;
            if description.is_some() {
                entry.description = description.clone();
            }
        })
    }

    /// Bump the persisted usage counter for one tool.
    pub fn record_tool_usage(&self, service: &str, tool: &str, used_at: String) -> Result<()> {
        self.mutate(|config| {
            let entry = config
                .server_tools
                .entry(service.to_string())
                .or_default()
                .entry(tool.to_string())
                .or_default();
            entry.usage_count += 1;
            entry.last_used_at = Some(used_at.clone());
        })
    }

    pub fn add_service(&self, name: &str, service: ServiceConfig) -> Result<()> {
        self.mutate(|config| {
            config.mcp_servers.insert(name.to_string(), service.clone());
        })
    }

    pub fn update_service(&self, name: &str, service: ServiceConfig) -> Result<()> {
        self.add_service(name, service)
    }

    pub fn remove_service(&self, name: &str) -> Result<()> {
        self.mutate(|config| {
            config.mcp_servers.remove(name);
            config.server_tools.remove(name);
        })
    }

    pub fn add_custom_mcp_tool(&self, tool: CustomTool) -> Result<()> {
        self.mutate(|config| {
            config.custom_mcp_tools.retain(|t| t.name != tool.name);
            config.custom_mcp_tools.push(tool.clone());
        })
    }

    pub fn update_custom_mcp_tool(&self, tool: CustomTool) -> Result<()> {
        self.add_custom_mcp_tool(tool)
    }

    pub fn remove_custom_mcp_tool(&self, name: &str) -> Result<()> {
        self.mutate(|config| {
            config.custom_mcp_tools.retain(|t| t.name != name);
        })
    }

    fn mutate<F>(&self, apply: F) -> Result<()>
    where
        F: Fn(&mut AppConfig),
    {
        let snapshot = {
            let mut config = self.inner.config.write();
            apply(&mut config);
            config.clone()
        };
        self.save(&snapshot)
    }

    fn save(&self, config: &AppConfig) -> Result<()> {
        let path = &self.inner.path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let body = serde_json::to_string_pretty(config).context("failed to serialize config")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

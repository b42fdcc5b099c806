//! On-disk cache: tool catalogs per service plus results of long-running
//! customMCP tool calls.
//!
//! Both caches live in one JSON document (`xiaozhi.cache.json` next to the
//! main config). Every save serializes the whole document to `<path>.tmp`
//! and renames it over `<path>`, so the file on disk is always a complete,
//! parseable snapshot.

use crate::config::schema::ServiceConfig;
use crate::protocol::ToolDef;
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const CACHE_FILE_VERSION: &str = "1.0.0";
const ENTRY_VERSION: &str = "1.0.0";

/// Default lifetime of a result-cache entry.
pub const DEFAULT_RESULT_TTL_MS: u64 = 300_000;

/// Period of the background eviction task.
const SWEEP_INTERVAL_SECS: u64 = 60;

// ── Document schema ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCacheEntry {
    pub tools: Vec<ToolDef>,
    pub last_updated: String,
    pub server_config_snapshot: ServiceConfig,
    pub config_hash: String,
    pub entry_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultCacheEntry {
    pub result: serde_json::Value,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    pub ttl_ms: u64,
    pub status: ResultStatus,
    pub consumed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl ResultCacheEntry {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.created_at) > self.ttl_ms as i64
    }

    /// Eviction predicate for the sweeper.
    pub fn should_cleanup(&self, now_ms: i64) -> bool {
        self.is_expired(now_ms)
            || (self.consumed && self.status == ResultStatus::Completed)
            || self.status == ResultStatus::Failed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub last_global_update: String,
    pub total_writes: u64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheFile {
    version: String,
    mcp_servers: HashMap<String, ToolCacheEntry>,
    metadata: CacheMetadata,
    #[serde(rename = "customMCPResults", default)]
    custom_mcp_results: HashMap<String, ResultCacheEntry>,
}

impl CacheFile {
    fn empty() -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            version: CACHE_FILE_VERSION.to_string(),
            mcp_servers: HashMap::new(),
            metadata: CacheMetadata {
                last_global_update: now.clone(),
                total_writes: 0,
                created_at: now,
            },
            custom_mcp_results: HashMap::new(),
        }
    }
}

// ── Keys and hashing ───────────────────────────────────────────────────────

/// Recursively sort object keys so the same logical value always hashes
/// to the same bytes.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: BTreeMap<&String, serde_json::Value> =
                    map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
                serde_json::to_value(sorted).unwrap_or_default()
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(canonicalize).collect())
            }
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Result-cache key: `sha256(tool_name || canonical(arguments))`.
pub fn result_key(tool_name: &str, arguments: &serde_json::Value) -> String {
    sha256_hex(&format!("{tool_name}{}", canonical_json(arguments)))
}

/// Fingerprint of a service config, stored with its tool-cache entry.
pub fn config_hash(config: &ServiceConfig) -> String {
    let value = serde_json::to_value(config).unwrap_or_default();
    sha256_hex(&canonical_json(&value))
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ── Store ──────────────────────────────────────────────────────────────────

/// Shared handle to the cache document. All writes funnel through one
/// mutex-guarded path; the on-disk file is replaced atomically.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<CacheStoreInner>,
}

struct CacheStoreInner {
    path: PathBuf,
    state: Mutex<CacheFile>,
}

impl CacheStore {
    /// Load `dir/xiaozhi.cache.json`. A missing file, unparseable content,
    /// or a top-level version mismatch all reinitialize an empty document.
    pub fn load_from_dir(dir: &Path) -> Self {
        let path = dir.join(crate::config::CACHE_FILE_NAME);
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<CacheFile>(&raw) {
                Ok(parsed) if parsed.version == CACHE_FILE_VERSION => parsed,
                Ok(parsed) => {
                    tracing::warn!(
                        "cache version `{}` does not match `{}`; reinitializing",
                        parsed.version,
                        CACHE_FILE_VERSION
                    );
                    CacheFile::empty()
                }
                Err(err) => {
                    tracing::warn!("cache file unreadable ({err}); reinitializing");
                    CacheFile::empty()
                }
            },
            Err(_) => CacheFile::empty(),
        };

        Self {
            inner: Arc::new(CacheStoreInner {
                path,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    // ── Tool cache ─────────────────────────────────────────────────────

    /// Record the tool list a service reported after a successful connect.
    pub async fn write_cache_entry(
        &self,
        service: &str,
        tools: &[ToolDef],
        config: &ServiceConfig,
    ) -> Result<()> {
        let snapshot = {
            let mut state = self.inner.state.lock();
            let now = Utc::now().to_rfc3339();
            state.mcp_servers.insert(
                service.to_string(),
                ToolCacheEntry {
                    tools: tools.to_vec(),
                    last_updated: now.clone(),
                    server_config_snapshot: config.clone(),
                    config_hash: config_hash(config),
                    entry_version: ENTRY_VERSION.to_string(),
                },
            );
            state.metadata.total_writes += 1;
            state.metadata.last_global_update = now;
            state.clone()
        };
        self.flush(&snapshot).await
    }

    pub fn cached_tools(&self, service: &str) -> Option<Vec<ToolDef>> {
        self.inner
            .state
            .lock()
            .mcp_servers
            .get(service)
            .map(|entry| entry.tools.clone())
    }

    pub fn cached_entry(&self, service: &str) -> Option<ToolCacheEntry> {
        self.inner.state.lock().mcp_servers.get(service).cloned()
    }

    /// All cached tools across services, names re-namespaced to
    /// `service__tool`.
    pub fn all_cached_tools(&self) -> Vec<ToolDef> {
        let state = self.inner.state.lock();
        let mut out = Vec::new();
        for (service, entry) in &state.mcp_servers {
            for tool in &entry.tools {
                out.push(ToolDef {
                    name: format!("{service}__{}", tool.name),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                });
            }
        }
        out
    }

    pub async fn remove_service(&self, service: &str) -> Result<()> {
        let snapshot = {
            let mut state = self.inner.state.lock();
            state.mcp_servers.remove(service);
            state.clone()
        };
        self.flush(&snapshot).await
    }

    pub fn metadata(&self) -> CacheMetadata {
        self.inner.state.lock().metadata.clone()
    }

    // ── Result cache ───────────────────────────────────────────────────

    /// Store a tool-call result (or pending marker) under its derived key.
    /// `retry_count` records how many re-dispatches preceded this run.
    /// Returns the key.
    pub async fn write_result(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
        result: serde_json::Value,
        status: ResultStatus,
        ttl_ms: Option<u64>,
        task_id: Option<String>,
        retry_count: u32,
    ) -> Result<String> {
        let key = result_key(tool_name, arguments);
        let snapshot = {
            let mut state = self.inner.state.lock();
            state.custom_mcp_results.insert(
                key.clone(),
                ResultCacheEntry {
                    result,
                    created_at: now_ms(),
                    ttl_ms: ttl_ms.unwrap_or(DEFAULT_RESULT_TTL_MS),
                    status,
                    consumed: false,
                    task_id,
                    retry_count,
                },
            );
            state.clone()
        };
        self.flush(&snapshot).await?;
        Ok(key)
    }

    /// Read a live entry; absent or expired entries yield None.
    pub fn read_result(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Option<ResultCacheEntry> {
        let key = result_key(tool_name, arguments);
        let state = self.inner.state.lock();
        let entry = state.custom_mcp_results.get(&key)?;
        if entry.is_expired(now_ms()) {
            return None;
        }
        Some(entry.clone())
    }

    /// Mutate an entry's status in place. Transitioning to `Failed`
    /// additionally marks the entry consumed so the sweeper can take it.
    pub async fn update_status(&self, key: &str, status: ResultStatus) -> Result<()> {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.custom_mcp_results.get_mut(key) {
                entry.status = status;
                if status == ResultStatus::Failed {
                    entry.consumed = true;
                }
            }
            state.clone()
        };
        self.flush(&snapshot).await
    }

    pub async fn mark_consumed(&self, key: &str) -> Result<()> {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.custom_mcp_results.get_mut(key) {
                entry.consumed = true;
            }
            state.clone()
        };
        self.flush(&snapshot).await
    }

    /// Drop every result entry whose cleanup predicate holds. Returns the
    /// number of entries removed.
    pub async fn cleanup_results(&self) -> Result<usize> {
        let (snapshot, removed) = {
            let mut state = self.inner.state.lock();
            let now = now_ms();
            let before = state.custom_mcp_results.len();
            state
                .custom_mcp_results
                .retain(|_, entry| !entry.should_cleanup(now));
            let removed = before - state.custom_mcp_results.len();
            (state.clone(), removed)
        };
        if removed > 0 {
            self.flush(&snapshot).await?;
        }
        Ok(removed)
    }

    /// Spawn the periodic eviction task. Aborting the handle stops it.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.cleanup_results().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("result cache sweep removed {n} entr(ies)"),
                    Err(err) => tracing::warn!("result cache sweep failed: {err}"),
                }
            }
        })
    }

    // ── Disk ───────────────────────────────────────────────────────────

    async fn flush(&self, snapshot: &CacheFile) -> Result<()> {
        let body = serde_json::to_string_pretty(snapshot).context("failed to serialize cache")?;
        let path = self.inner.path.clone();
        let tmp = path.with_extension("json.tmp");

        if let Err(err) = tokio::fs::write(&tmp, body).await {
            // Abandon a half-written temp file; the original stays intact.
            let _ = tokio::fs::write(&tmp, b"").await;
            return Err(err)
                .with_context(|| format!("failed to write {}", tmp.display()));
        }
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDef {
        ToolDef {
            name: name.to_string(),
            description: Some(format!("{name} tool")),
            input_schema: json!({"type": "object"}),
        }
    }

    fn store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::load_from_dir(dir.path());
        (dir, store)
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"z": true, "y": [{"q": 1, "p": 2}]}});
        let b = json!({"a": {"y": [{"p": 2, "q": 1}], "z": true}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn result_key_ignores_argument_key_order() {
        let k1 = result_key("report", &json!({"a": 1, "b": 2}));
        let k2 = result_key("report", &json!({"b": 2, "a": 1}));
        let k3 = result_key("report", &json!({"a": 1, "b": 3}));
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1.len(), 64);
    }

    #[tokio::test]
    async fn tool_cache_roundtrip_preserves_fields() {
        let (dir, store) = store();
        let cfg = ServiceConfig {
            command: Some("node".into()),
            args: vec!["calc.js".into()],
            ..Default::default()
        };
        store
            .write_cache_entry("calc", &[tool("add"), tool("sub")], &cfg)
            .await
            .unwrap();

        let reloaded = CacheStore::load_from_dir(dir.path());
        let entry = reloaded.cached_entry("calc").unwrap();
        assert_eq!(entry.tools.len(), 2);
        assert_eq!(entry.tools[0].name, "add");
        assert_eq!(entry.tools[0].description.as_deref(), Some("add tool"));
        assert_eq!(entry.config_hash, config_hash(&cfg));
        assert_eq!(reloaded.metadata().total_writes, 1);
    }

    #[tokio::test]
    async fn all_cached_tools_renames_to_public_namespace() {
        let (_dir, store) = store();
        store
            .write_cache_entry("calc", &[tool("add")], &ServiceConfig::default())
            .await
            .unwrap();

        let all = store.all_cached_tools();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "calc__add");
    }

    #[tokio::test]
    async fn version_mismatch_reinitializes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(crate::config::CACHE_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"version":"0.9.0","mcp_servers":{},"metadata":{"last_global_update":"x","total_writes":9,"created_at":"x"},"customMCPResults":{}}"#,
        )
        .unwrap();

        let store = CacheStore::load_from_dir(dir.path());
        assert_eq!(store.metadata().total_writes, 0);
    }

    #[tokio::test]
    async fn file_on_disk_always_parses() {
        let (dir, store) = store();
        for i in 0..5 {
            store
                .write_cache_entry(&format!("svc{i}"), &[tool("t")], &ServiceConfig::default())
                .await
                .unwrap();
            let raw = std::fs::read_to_string(dir.path().join(crate::config::CACHE_FILE_NAME))
                .unwrap();
            let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(parsed["version"], CACHE_FILE_VERSION);
            assert!(parsed["mcp_servers"].is_object());
            assert!(parsed["metadata"].is_object());
        }
    }

    #[tokio::test]
    async fn result_cache_ttl_expiry() {
        let (_dir, store) = store();
        let args = json!({"x": 1});
        store
            .write_result("task", &args, json!("pending"), ResultStatus::Pending, Some(100), None, 0)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.read_result("task", &args).is_some());

        tokio::time::sleep(Duration::from_millis(160)).await;
        assert!(store.read_result("task", &args).is_none());

        let removed = store.cleanup_results().await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn failed_status_marks_consumed_and_sweepable() {
        let (_dir, store) = store();
        let args = json!({});
        let key = store
            .write_result("task", &args, json!(null), ResultStatus::Pending, None, None, 0)
            .await
            .unwrap();

        store.update_status(&key, ResultStatus::Failed).await.unwrap();
        let entry = store.read_result("task", &args).unwrap();
        assert!(entry.consumed);
        assert_eq!(entry.status, ResultStatus::Failed);
        assert!(entry.should_cleanup(now_ms()));
    }

    #[tokio::test]
    async fn consumed_completed_entries_are_sweepable_before_ttl() {
        let (_dir, store) = store();
        let args = json!({"job": 7});
        let key = store
            .write_result("task", &args, json!({"ok": true}), ResultStatus::Completed, None, None, 0)
            .await
            .unwrap();

        assert_eq!(store.cleanup_results().await.unwrap(), 0);
        store.mark_consumed(&key).await.unwrap();
        assert_eq!(store.cleanup_results().await.unwrap(), 1);
        assert!(store.read_result("task", &args).is_none());
    }

    #[tokio::test]
    async fn pending_unconsumed_entries_survive_sweep() {
        let (_dir, store) = store();
        store
            .write_result("task", &json!({}), json!(null), ResultStatus::Pending, None, Some("t-1".into()), 0)
            .await
            .unwrap();
        assert_eq!(store.cleanup_results().await.unwrap(), 0);
        let entry = store.read_result("task", &json!({})).unwrap();
        assert_eq!(entry.task_id.as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn retry_count_roundtrips_through_rewrite() {
        let (_dir, store) = store();
        let args = json!({"job": 1});
        store
            .write_result("task", &args, json!(null), ResultStatus::Pending, None, Some("t-1".into()), 0)
            .await
            .unwrap();
        // A re-dispatch after a failure overwrites the same key with a
        // bumped counter.
        store
            .write_result("task", &args, json!(null), ResultStatus::Pending, None, Some("t-2".into()), 1)
            .await
            .unwrap();

        let entry = store.read_result("task", &args).unwrap();
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.task_id.as_deref(), Some("t-2"));
    }
}

//! Stdio transport client: spawn a local MCP server and speak
//! newline-delimited JSON-RPC over its stdin/stdout.

use crate::config::schema::{ServiceConfig, TransportKind};
use crate::error::{GatewayError, Result};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::service::transport::{RequestOutcome, ServiceClient};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

/// Maximum bytes for a single response line.
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024; // 4 MB

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Decide the log level for one stderr line from a child server.
/// Returns true when the line should log at error level.
fn stderr_line_is_error(line: &str) -> bool {
    line.contains("[ERROR]") || line.contains("Error:") || line.contains("Failed")
}

pub struct StdioClient {
    name: String,
    child: Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<tokio::process::ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: AtomicBool,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stderr_reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StdioClient {
    /// Spawn the child process and start the stdout/stderr readers.
    pub fn spawn(name: &str, config: &ServiceConfig) -> Result<Self> {
        let command = config.command.as_deref().ok_or_else(|| {
            GatewayError::Validation(format!("service `{name}` has no command for stdio"))
        })?;

        let mut child = Command::new(command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::Transport(format!("failed to spawn `{command}`: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Transport(format!("no stdin on `{name}`")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Transport(format!("no stdout on `{name}`")))?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let reader = {
            let pending = pending.clone();
            let service = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if line.len() > MAX_LINE_BYTES {
                                tracing::warn!(
                                    "service `{service}`: dropping oversized line ({} bytes)",
                                    line.len()
                                );
                                continue;
                            }
                            route_line(&service, &line, &pending);
                        }
                        Ok(None) => {
                            tracing::debug!("service `{service}`: stdout closed");
                            break;
                        }
                        Err(err) => {
                            tracing::warn!("service `{service}`: stdout read failed: {err}");
                            break;
                        }
                    }
                }
                // Unanswered requests observe the drop as a transport error.
                pending.lock().clear();
            })
        };

        let stderr_reader = stderr.map(|stderr| {
            let service = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if stderr_line_is_error(&line) {
                        tracing::error!("service `{service}` stderr: {line}");
                    } else {
                        tracing::info!("service `{service}` stderr: {line}");
                    }
                }
            })
        });

        Ok(Self {
            name: name.to_string(),
            child: Mutex::new(Some(child)),
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
            stderr_reader: Mutex::new(stderr_reader),
        })
    }

    async fn send_line(&self, line: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport(format!(
                "stdio client for `{}` is closed",
                self.name
            )));
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Route one stdout line: responses resolve their pending entry, anything
/// else (server-initiated notifications, noise) is logged and dropped.
fn route_line(service: &str, line: &str, pending: &PendingMap) {
    let parsed: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!("service `{service}`: unparseable stdout line ({err})");
            return;
        }
    };

    let has_reply_shape = parsed.get("result").is_some() || parsed.get("error").is_some();
    let id = parsed.get("id").and_then(Value::as_u64);

    match (id, has_reply_shape) {
        (Some(id), true) => {
            let response: JsonRpcResponse = match serde_json::from_value(parsed) {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!("service `{service}`: malformed response for id {id}: {err}");
                    return;
                }
            };
            match pending.lock().remove(&id) {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                // Late delivery after the caller already timed out.
                None => tracing::debug!("service `{service}`: response for unknown id {id}"),
            }
        }
        _ => {
            let method = parsed.get("method").and_then(Value::as_str).unwrap_or("?");
            tracing::debug!("service `{service}`: ignoring server message `{method}`");
        }
    }
}

#[async_trait::async_trait]
impl ServiceClient for StdioClient {
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<RequestOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(err) = self.send_line(&line).await {
            self.pending.lock().remove(&id);
            return Err(err);
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(GatewayError::Transport(format!(
                    "service `{}` closed before replying to `{method}`",
                    self.name
                )));
            }
            Err(_) => {
                // The pending slot resolves with the synthetic timeout
                // marker; a late reply is dropped by the reader.
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
        self.send_line(&serde_json::to_string(&request)?).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.stderr_reader.lock().take() {
            handle.abort();
        }
        self.pending.lock().clear();

        let child = self.child.lock().take();
        if let Some(mut child) = child {
            let _ = child.kill().await;
        }
        Ok(())
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

//! Stdio adapter: newline-delimited JSON-RPC on the process's own
//! stdin/stdout.

use crate::adapters::{AdapterCore, AdapterState, TransportAdapter};
use crate::error::{GatewayError, Result};
use crate::handler::MessageHandler;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

pub struct StdioAdapter {
    core: AdapterCore,
    handler: Arc<MessageHandler>,
    buffer_size: usize,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    outbound: Mutex<Option<tokio::sync::mpsc::Sender<String>>>,
}

impl StdioAdapter {
    pub fn new(handler: Arc<MessageHandler>) -> Self {
        Self::with_buffer_size(handler, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(handler: Arc<MessageHandler>, buffer_size: usize) -> Self {
        Self {
            core: AdapterCore::new("stdio"),
            handler,
            buffer_size,
            reader_task: Mutex::new(None),
            outbound: Mutex::new(None),
        }
    }
}

/// Process one inbound line. Returns the serialized response line, or None
/// for notifications and for lines that are not JSON at all (those are
/// logged and skipped, since no id can be recovered from them).
pub async fn process_line(handler: &MessageHandler, line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let message: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!("stdio adapter: skipping malformed line ({err})");
            return None;
        }
    };

    let response = handler.handle(message).await?;
    match serde_json::to_string(&response) {
        Ok(line) => Some(line),
        Err(err) => {
            tracing::error!("stdio adapter: failed to serialize response: {err}");
            None
        }
    }
}

#[async_trait::async_trait]
impl TransportAdapter for StdioAdapter {
    async fn initialize(&self) -> Result<()> {
        self.core.reset();
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.core.begin_connect()?;

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        *self.outbound.lock() = Some(tx);

        let handler = self.handler.clone();
        let buffer_size = self.buffer_size;
        let task = tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let mut stdout = tokio::io::stdout();
            let mut lines = BufReader::with_capacity(buffer_size, stdin).lines();

            loop {
                tokio::select! {
                    inbound = lines.next_line() => {
                        match inbound {
                            Ok(Some(line)) => {
                                if let Some(reply) = process_line(&handler, &line).await {
                                    if write_line(&mut stdout, &reply).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                tracing::warn!("stdio adapter read failed: {err}");
                                break;
                            }
                        }
                    }
                    Some(outbound) = rx.recv() => {
                        if write_line(&mut stdout, &outbound).await.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("stdio adapter loop ended");
        });

        *self.reader_task.lock() = Some(task);
        self.core.mark_connected();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        *self.outbound.lock() = None;
        self.core.mark_disconnected();
        Ok(())
    }

    async fn send_message(&self, message: serde_json::Value) -> Result<()> {
        if self.state() != AdapterState::Connected {
            return Err(GatewayError::NotConnected("stdio adapter".into()));
        }
        let sender = self
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| GatewayError::NotConnected("stdio adapter".into()))?;
        sender
            .send(serde_json::to_string(&message)?)
            .await
            .map_err(|_| GatewayError::Transport("stdio adapter is shutting down".into()))
    }

    fn connection_id(&self) -> String {
        self.core.id().to_string()
    }

    fn state(&self) -> AdapterState {
        self.core.state()
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

//! Inbound transport adapters.
//!
//! Every adapter exposes the same gateway over a different transport and
//! funnels messages into one shared `MessageHandler`. The lifecycle
//! contract is uniform: `initialize` → `start` → `stop`, with `error` as a
//! terminal state until the adapter is re-initialized.

pub mod http;
pub mod session;
pub mod stdio;
pub mod websocket;

use crate::error::{GatewayError, Result};
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl AdapterState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

/// Uniform adapter contract.
#[async_trait::async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Reset into `disconnected`, clearing a terminal `error` state.
    async fn initialize(&self) -> Result<()>;
    async fn start(&self) -> Result<()>;
    /// Stop serving. Idempotent and callable from any task.
    async fn stop(&self) -> Result<()>;
    /// Push a server-initiated message to the connected peer(s).
    async fn send_message(&self, message: serde_json::Value) -> Result<()>;
    fn connection_id(&self) -> String;
    fn state(&self) -> AdapterState;
}

/// State machine shared by the adapter implementations.
pub struct AdapterCore {
    id: String,
    state: RwLock<AdapterState>,
}

impl AdapterCore {
    pub fn new(kind: &str) -> Self {
        Self {
            id: format!("{kind}-{}", uuid::Uuid::new_v4()),
            state: RwLock::new(AdapterState::Disconnected),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> AdapterState {
        *self.state.read()
    }

    /// `initialize`: any state (including terminal error) back to
    /// disconnected.
    pub fn reset(&self) {
        *self.state.write() = AdapterState::Disconnected;
    }

    /// `disconnected → connecting`. Starting from error requires an
    /// explicit initialize first.
    pub fn begin_connect(&self) -> Result<()> {
        let mut state = self.state.write();
        match *state {
            AdapterState::Disconnected => {
                *state = AdapterState::Connecting;
                Ok(())
            }
            AdapterState::Error => Err(GatewayError::Internal(
                "adapter is in error state; initialize it first".into(),
            )),
            other => Err(GatewayError::Internal(format!(
                "adapter cannot start from `{}`",
                other.label()
            ))),
        }
    }

    /// `connecting → connected`.
    pub fn mark_connected(&self) {
        *self.state.write() = AdapterState::Connected;
    }

    /// Any state → disconnected (normal stop path).
    pub fn mark_disconnected(&self) {
        let mut state = self.state.write();
        if *state != AdapterState::Error {
            *state = AdapterState::Disconnected;
        }
    }

    /// Any state → error (terminal until reset).
    pub fn mark_error(&self) {
        *self.state.write() = AdapterState::Error;
    }
}

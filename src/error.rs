//! Gateway error taxonomy.
//!
//! Validation errors stop at the adapter that produced them. Transport
//! errors bubble to the owning manager, which decides between absorbing
//! (reconnect) and surfacing. Everything else surfaces as a JSON-RPC error
//! without crashing the process.

use crate::protocol::{INTERNAL_ERROR, INVALID_REQUEST};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Bad user input: malformed envelope, invalid service name, bad sort field.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown service or tool.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate service name on add.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Tool call against a service that is not connected.
    #[error("service `{0}` is not connected")]
    NotConnected(String),

    /// Connect timeout, broken pipe, dropped socket.
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream tool-call failure, forwarded verbatim.
    #[error("{0}")]
    Upstream(String),

    /// Outbound request exceeded its deadline.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Unexpected failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// JSON-RPC error code for this failure.
    ///
    /// Validation maps to -32600; everything else that reaches an RPC reply
    /// is wrapped in -32603 with a descriptive message.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::Validation(_) => INVALID_REQUEST,
            _ => INTERNAL_ERROR,
        }
    }

    /// HTTP status for REST-style surfaces.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {err}"))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

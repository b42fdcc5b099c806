//! Transport selection and the client contract shared by all transports.

use crate::config::schema::{ServiceConfig, TransportKind};
use crate::error::{GatewayError, Result};
use serde_json::Value;
use std::time::Duration;

/// Decide which transport a service config uses.
///
/// Order: an explicit `type` wins; then `command` means stdio; then the
/// URL path suffix picks between SSE (`/sse`) and streamable HTTP
/// (`/mcp`, and the default for anything else). A config with neither
/// `command` nor `url` is invalid.
pub fn infer_transport(name: &str, config: &ServiceConfig) -> Result<TransportKind> {
    if let Some(kind) = config.transport {
        return Ok(kind);
    }
    if config.command.is_some() {
        return Ok(TransportKind::Stdio);
    }
    if let Some(url) = config.url.as_deref() {
        return Ok(infer_from_url(name, url));
    }
    Err(GatewayError::Validation(format!(
        "service `{name}` has neither `command` nor `url`"
    )))
}

fn infer_from_url(name: &str, url: &str) -> TransportKind {
    let path = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(err) => {
            tracing::warn!(
                "service `{name}`: url `{url}` did not parse ({err}); assuming streamable HTTP"
            );
            return TransportKind::StreamableHttp;
        }
    };

    if path.ends_with("/sse") {
        TransportKind::Sse
    } else {
        // `/mcp` and every unknown suffix take the streamable transport.
        TransportKind::StreamableHttp
    }
}

/// What came back for one outbound request.
///
/// A deadline expiry resolves the pending slot with the `TimedOut`
/// sentinel instead of failing it; the reply that never arrived may
/// still be delivered out-of-band later and is dropped quietly.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Reply(Value),
    TimedOut { timeout_ms: u64 },
}

impl RequestOutcome {
    /// Unwrap the reply, surfacing the timeout sentinel as the timeout
    /// failure the RPC layer reports.
    pub fn into_reply(self) -> Result<Value> {
        match self {
            Self::Reply(value) => Ok(value),
            Self::TimedOut { timeout_ms } => Err(GatewayError::Timeout(timeout_ms)),
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// Capability set every upstream transport implements.
///
/// The service instance layers the MCP handshake and tool bookkeeping on
/// top; clients only move JSON-RPC envelopes.
#[async_trait::async_trait]
pub trait ServiceClient: Send + Sync {
    /// Send a request and wait for the matching response's `result`.
    /// A JSON-RPC error response surfaces as `GatewayError::Upstream`;
    /// a deadline expiry yields `Ok(RequestOutcome::TimedOut)`.
    async fn request(&self, method: &str, params: Value, timeout: Duration)
        -> Result<RequestOutcome>;

    /// Fire a notification; no response is expected.
    async fn notify(&self, method: &str, params: Value) -> Result<()>;

    /// Release sockets or child processes. Idempotent.
    async fn close(&self) -> Result<()>;

    fn transport(&self) -> TransportKind;
}

/// Construct (but do not handshake) a client for the inferred transport.
pub async fn create_client(
    name: &str,
    config: &ServiceConfig,
) -> Result<Box<dyn ServiceClient>> {
    match infer_transport(name, config)? {
        TransportKind::Stdio => Ok(Box::new(super::stdio::StdioClient::spawn(name, config)?)),
        TransportKind::Sse => Ok(Box::new(super::http::SseClient::connect(name, config).await?)),
        TransportKind::StreamableHttp => Ok(Box::new(super::http::StreamableHttpClient::new(
            name, config,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_url(url: &str) -> ServiceConfig {
        ServiceConfig {
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn explicit_type_wins() {
        let config = ServiceConfig {
            transport: Some(TransportKind::Sse),
            command: Some("node".into()),
            ..Default::default()
        };
        assert_eq!(infer_transport("s", &config).unwrap(), TransportKind::Sse);
    }

    #[test]
    fn command_implies_stdio() {
        let config = ServiceConfig {
            command: Some("node".into()),
            ..Default::default()
        };
        assert_eq!(infer_transport("s", &config).unwrap(), TransportKind::Stdio);
    }

    #[test]
    fn url_suffix_selects_transport() {
        assert_eq!(
            infer_transport("s", &with_url("https://h/sse")).unwrap(),
            TransportKind::Sse
        );
        assert_eq!(
            infer_transport("s", &with_url("https://h/mcp")).unwrap(),
            TransportKind::StreamableHttp
        );
        assert_eq!(
            infer_transport("s", &with_url("https://h/foo")).unwrap(),
            TransportKind::StreamableHttp
        );
    }

    #[test]
    fn suffix_match_is_case_sensitive() {
        assert_eq!(
            infer_transport("s", &with_url("https://h/SSE")).unwrap(),
            TransportKind::StreamableHttp
        );
    }

    #[test]
    fn unparseable_url_defaults_to_streamable() {
        assert_eq!(
            infer_transport("s", &with_url("not a url")).unwrap(),
            TransportKind::StreamableHttp
        );
    }

    #[test]
    fn empty_config_is_invalid() {
        assert!(matches!(
            infer_transport("s", &ServiceConfig::default()),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn inference_is_deterministic() {
        let config = with_url("https://h/sse");
        let a = infer_transport("s", &config).unwrap();
        let b = infer_transport("s", &config).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn timeout_sentinel_surfaces_as_timeout_on_unwrap() {
        let outcome = RequestOutcome::TimedOut { timeout_ms: 8_000 };
        assert!(outcome.is_timed_out());
        assert!(matches!(
            outcome.into_reply(),
            Err(GatewayError::Timeout(8_000))
        ));

        let reply = RequestOutcome::Reply(serde_json::json!({"ok": true}));
        assert!(!reply.is_timed_out());
        assert_eq!(reply.into_reply().unwrap()["ok"], true);
    }
}

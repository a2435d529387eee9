//! The gateway-wide failure taxonomy.
//!
//! Component boundaries translate implementation failures into these kinds;
//! callers never see raw transport or HTTP error types. Every variant maps
//! to a stable kind tag used in metrics, retry policies and user-facing
//! footers.

use std::io;
use std::time::Duration;

use agentgate_mcp_client::TransportError;
use agentgate_ollama::LlmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("server '{server}' failed to start: {reason}")]
    Spawn { server: String, reason: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("deadline exceeded")]
    Timeout,
    #[error("rate limit exceeded, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("circuit open for endpoint '{endpoint}'")]
    CircuitOpen { endpoint: String },
    #[error("bulkhead '{class}' has no free slots")]
    ResourceExhausted { class: &'static str },
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("unknown server '{0}'")]
    UnknownServer(String),
    #[error("unknown tool '{server}.{tool}'")]
    UnknownTool { server: String, tool: String },
    #[error("gateway is shutting down")]
    ShuttingDown,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl GatewayError {
    /// Stable machine-readable tag for this failure.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Configuration(_) => "configuration",
            GatewayError::Spawn { .. } => "spawn",
            GatewayError::Transport(inner) => inner.kind(),
            GatewayError::Timeout => "timeout",
            GatewayError::RateLimited { .. } => "rate-limit",
            GatewayError::CircuitOpen { .. } => "circuit-open",
            GatewayError::ResourceExhausted { .. } => "resource-exhausted",
            GatewayError::Llm(inner) => inner.kind(),
            GatewayError::UnknownServer(_) => "unknown-server",
            GatewayError::UnknownTool { .. } => "unknown-tool",
            GatewayError::ShuttingDown => "shutting-down",
            GatewayError::Io(_) => "io",
        }
    }

    /// Kinds that may succeed on a later attempt against the same endpoint.
    pub const DEFAULT_RETRYABLE_KINDS: &'static [&'static str] =
        &["timeout", "connection-lost", "llm-unreachable", "llm-server"];

    pub fn is_retryable(&self) -> bool {
        Self::DEFAULT_RETRYABLE_KINDS.contains(&self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kinds_pass_through() {
        let err = GatewayError::from(TransportError::Timeout);
        assert_eq!(err.kind(), "timeout");
        assert!(err.is_retryable());

        let err = GatewayError::from(TransportError::Rpc {
            code: -32000,
            message: "boom".to_string(),
        });
        assert_eq!(err.kind(), "protocol");
        assert!(!err.is_retryable());
    }

    #[test]
    fn llm_server_errors_are_retryable() {
        assert!(GatewayError::from(LlmError::ServerStatus(502)).is_retryable());
        assert!(!GatewayError::from(LlmError::ClientStatus(400)).is_retryable());
    }

    #[test]
    fn gate_errors_are_not_retryable() {
        let err = GatewayError::CircuitOpen {
            endpoint: "llm.generate".to_string(),
        };
        assert!(!err.is_retryable());
        let err = GatewayError::RateLimited {
            retry_after: Duration::from_secs(1),
        };
        assert!(!err.is_retryable());
    }
}

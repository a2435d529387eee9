//! Stdio transport for tool servers.
//!
//! [`McpClient`] owns one child process speaking newline-delimited JSON-RPC
//! 2.0 on its stdin/stdout and multiplexes concurrent in-flight requests by
//! id. The crate also ships `agentgate-stub-server`, a small deterministic
//! tool server used by the integration tests and for local smoke runs.

mod mcp_client;
pub mod stub_server;

pub use mcp_client::McpClient;
pub use mcp_client::SessionState;
pub use mcp_client::TransportError;

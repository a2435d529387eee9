//! End-to-end transport tests against the stub tool server running as a
//! real child process.

use std::ffi::OsString;
use std::time::Duration;
use std::time::Instant;

use serde_json::json;

use agentgate_mcp_client::McpClient;
use agentgate_mcp_client::SessionState;
use agentgate_mcp_client::TransportError;
use agentgate_protocol::ClientCapabilities;
use agentgate_protocol::Implementation;
use agentgate_protocol::InitializeParams;
use agentgate_protocol::MCP_SCHEMA_VERSION;

fn stub_server_exe() -> OsString {
    OsString::from(env!("CARGO_BIN_EXE_agentgate-stub-server"))
}

fn initialize_params() -> InitializeParams {
    InitializeParams {
        protocol_version: MCP_SCHEMA_VERSION.to_string(),
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "agentgate-tests".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    }
}

async fn connect() -> McpClient {
    let client = McpClient::new_stdio_client("stub", stub_server_exe(), Vec::new(), None, None)
        .await
        .expect("spawn stub server");
    client
        .initialize(initialize_params(), Some(Duration::from_secs(10)))
        .await
        .expect("initialize handshake");
    client
}

#[tokio::test]
async fn initialize_then_list_tools_is_stable() {
    let client = connect().await;
    assert!(client.is_ready());

    let first = client
        .list_tools(Some(Duration::from_secs(5)))
        .await
        .expect("list tools");
    let names: Vec<&str> = first.tools.iter().map(|tool| tool.name.as_str()).collect();
    assert!(names.contains(&"echo"));
    assert!(names.contains(&"sleep_ms"));

    let second = client
        .list_tools(Some(Duration::from_secs(5)))
        .await
        .expect("list tools again");
    assert_eq!(first, second);

    client.disconnect(Duration::from_secs(1)).await.expect("disconnect");
}

#[tokio::test]
async fn call_tool_round_trips_text_content() {
    let client = connect().await;
    let result = client
        .call_tool(
            "echo".to_string(),
            Some(json!({"text": "Hello, world!"})),
            Some(Duration::from_secs(5)),
        )
        .await
        .expect("echo call");
    assert_eq!(result.text_content(), "Hello, world!");
    assert_eq!(result.is_error, Some(false));

    client.disconnect(Duration::from_secs(1)).await.expect("disconnect");
}

#[tokio::test]
async fn rpc_error_fails_the_call_but_not_the_session() {
    let client = connect().await;

    let err = client
        .call_tool("fail".to_string(), None, Some(Duration::from_secs(5)))
        .await
        .expect_err("fail tool must error");
    match err {
        TransportError::Rpc { code, .. } => assert_eq!(code, -32603),
        other => panic!("expected Rpc error, got {other:?}"),
    }

    // The session stays healthy after a per-call protocol error.
    let result = client
        .call_tool(
            "echo".to_string(),
            Some(json!({"text": "still alive"})),
            Some(Duration::from_secs(5)),
        )
        .await
        .expect("echo after failure");
    assert_eq!(result.text_content(), "still alive");

    client.disconnect(Duration::from_secs(1)).await.expect("disconnect");
}

#[tokio::test]
async fn timeout_cleans_pending_and_discards_the_late_reply() {
    let client = connect().await;

    let err = client
        .call_tool(
            "sleep_ms".to_string(),
            Some(json!({"ms": 400})),
            Some(Duration::from_millis(50)),
        )
        .await
        .expect_err("sleep must outlive the deadline");
    assert!(matches!(err, TransportError::Timeout));
    assert_eq!(client.in_flight().await, 0);

    // The stub replies to the sleep first (late, discarded), then to this
    // echo; id matching keeps the answers straight.
    let result = client
        .call_tool(
            "echo".to_string(),
            Some(json!({"text": "after timeout"})),
            Some(Duration::from_secs(5)),
        )
        .await
        .expect("echo after timeout");
    assert_eq!(result.text_content(), "after timeout");

    client.disconnect(Duration::from_secs(1)).await.expect("disconnect");
}

#[tokio::test]
async fn oversized_reply_is_dropped_without_killing_the_stream() {
    let client = connect().await;

    let err = client
        .call_tool(
            "blob".to_string(),
            Some(json!({"bytes": 11 * 1024 * 1024})),
            Some(Duration::from_secs(2)),
        )
        .await
        .expect_err("oversized frame must not be delivered");
    assert!(matches!(err, TransportError::Timeout));

    let result = client
        .call_tool(
            "echo".to_string(),
            Some(json!({"text": "recovered"})),
            Some(Duration::from_secs(5)),
        )
        .await
        .expect("echo after oversized frame");
    assert_eq!(result.text_content(), "recovered");

    client.disconnect(Duration::from_secs(1)).await.expect("disconnect");
}

#[tokio::test]
async fn server_exit_fails_pending_calls_with_connection_lost() {
    let client = connect().await;

    let err = client
        .call_tool("exit".to_string(), None, Some(Duration::from_secs(5)))
        .await
        .expect_err("exit never replies");
    assert!(matches!(err, TransportError::ConnectionLost));
    assert_eq!(client.in_flight().await, 0);

    // Once the child is gone the session refuses new work.
    let err = client
        .call_tool("echo".to_string(), None, Some(Duration::from_secs(1)))
        .await
        .expect_err("closed session must fail fast");
    assert!(matches!(err, TransportError::Closed));
}

#[tokio::test]
async fn disconnect_terminates_the_child_and_closes_the_session() {
    let client = connect().await;
    let started = Instant::now();
    client
        .disconnect(Duration::from_secs(1))
        .await
        .expect("disconnect");
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(client.state(), SessionState::Closed);

    // Idempotent.
    client
        .disconnect(Duration::from_secs(1))
        .await
        .expect("second disconnect");
}

//! A deterministic stdio tool server.
//!
//! Speaks the same newline-delimited JSON-RPC dialect the gateway consumes
//! and exposes a handful of predictable tools (`echo`, `sleep_ms`, `blob`,
//! `fail`, `exit`). The integration tests drive the transport against it as
//! a real child process; it also doubles as a smoke-test target for a local
//! gateway setup.

use std::io;
use std::io::BufRead;
use std::io::Write;
use std::thread;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;

use agentgate_protocol::INTERNAL_ERROR;
use agentgate_protocol::METHOD_NOT_FOUND;

/// Run the server loop until stdin reaches EOF.
pub fn run() -> io::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(_) => continue,
        };
        let id = message.get("id").cloned();
        let has_id = id.as_ref().is_some_and(|value| !value.is_null());
        let method = message
            .get("method")
            .and_then(|method| method.as_str())
            .unwrap_or("");
        let params = message.get("params").cloned().unwrap_or_else(|| json!({}));

        let reply = match method {
            "initialize" => {
                let protocol = params
                    .get("protocolVersion")
                    .and_then(|version| version.as_str())
                    .unwrap_or("2025-03-26");
                Some(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "protocolVersion": protocol,
                        "capabilities": {"tools": {}},
                        "serverInfo": {
                            "name": "agentgate-stub-server",
                            "version": env!("CARGO_PKG_VERSION"),
                        }
                    }
                }))
            }
            "notifications/initialized" => None,
            "tools/list" => Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"tools": tool_definitions()}
            })),
            "tools/call" => Some(handle_call(id, &params)),
            _ => {
                if has_id {
                    Some(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": METHOD_NOT_FOUND, "message": "method not found"}
                    }))
                } else {
                    None
                }
            }
        };

        if let Some(reply) = reply {
            let encoded = serde_json::to_string(&reply)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            writeln!(stdout, "{encoded}")?;
            stdout.flush()?;
        }
    }

    Ok(())
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": "echo",
            "description": "Echo the given text back",
            "inputSchema": {
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }
        },
        {
            "name": "sleep_ms",
            "description": "Sleep for the given number of milliseconds, then reply",
            "inputSchema": {
                "type": "object",
                "properties": {"ms": {"type": "integer"}},
                "required": ["ms"]
            }
        },
        {
            "name": "blob",
            "description": "Reply with a payload of the given size in bytes",
            "inputSchema": {
                "type": "object",
                "properties": {"bytes": {"type": "integer"}},
                "required": ["bytes"]
            }
        },
        {
            "name": "fail",
            "description": "Always return a JSON-RPC error",
            "inputSchema": {"type": "object"}
        },
        {
            "name": "exit",
            "description": "Exit the server process without replying",
            "inputSchema": {"type": "object"}
        }
    ])
}

fn handle_call(id: Option<Value>, params: &Value) -> Value {
    let name = params
        .get("name")
        .and_then(|name| name.as_str())
        .unwrap_or("");
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name {
        "echo" => {
            let text = arguments
                .get("text")
                .and_then(|text| text.as_str())
                .unwrap_or("");
            text_result(id, text)
        }
        "sleep_ms" => {
            let ms = arguments.get("ms").and_then(|ms| ms.as_u64()).unwrap_or(0);
            thread::sleep(Duration::from_millis(ms));
            text_result(id, &format!("slept {ms}ms"))
        }
        "blob" => {
            let bytes = arguments
                .get("bytes")
                .and_then(|bytes| bytes.as_u64())
                .unwrap_or(0) as usize;
            text_result(id, &"x".repeat(bytes))
        }
        "fail" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": INTERNAL_ERROR, "message": "tool failed on purpose"}
        }),
        "exit" => std::process::exit(0),
        other => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": METHOD_NOT_FOUND, "message": format!("unknown tool '{other}'")}
        }),
    }
}

fn text_result(id: Option<Value>, text: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "content": [{"type": "text", "text": text}],
            "isError": false
        }
    })
}

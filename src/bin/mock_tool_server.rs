//! Mock MCP tool server for integration tests.
//!
//! Speaks newline-delimited JSON-RPC on stdio, the way a real backing
//! process would. Tools:
//!
//! - `echo` doubles its `n` argument and reports a global invocation
//!   counter, so a caching layer in front of it is observable: a cached
//!   response repeats the counter value of the call that produced it.
//! - `fail` always returns a JSON-RPC error that embeds the counter.
//! - `notify` emits a `notifications/message` notification before
//!   responding.
//!
//! The credential flag the proxy appends (`--api-key <value>`) is accepted
//! and ignored.

use std::io::{BufRead, Write};

use serde_json::{json, Value};

fn main() {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut invocations: u64 = 0;

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(_) => continue,
        };

        // Notifications carry no id and get no response
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let response = match method.as_str() {
            "initialize" => success(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "mock-tool-server", "version": "1.2.3" },
                }),
            ),
            "tools/list" => success(
                id,
                json!({
                    "tools": [{
                        "name": "echo",
                        "description": "Doubles the given number",
                        "inputSchema": {
                            "type": "object",
                            "properties": { "n": { "type": "integer" } },
                            "required": ["n"]
                        }
                    }]
                }),
            ),
            "tools/call" => {
                invocations += 1;
                handle_call(id, message.get("params"), invocations, &mut stdout)
            }
            _ => error(id, -32601, format!("method not found: {}", method)),
        };

        write_line(&mut stdout, &response);
    }
}

fn handle_call(
    id: Value,
    params: Option<&Value>,
    invocations: u64,
    stdout: &mut std::io::Stdout,
) -> Value {
    let name = params
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let arguments = params
        .and_then(|p| p.get("arguments"))
        .cloned()
        .unwrap_or_else(|| json!({}));

    match name {
        "echo" => {
            let n = arguments.get("n").and_then(Value::as_i64).unwrap_or(0);
            success(
                id,
                json!({
                    "content": [{ "type": "text", "text": (n * 2).to_string() }],
                    "invocation": invocations,
                }),
            )
        }
        "notify" => {
            let notification = json!({
                "jsonrpc": "2.0",
                "method": "notifications/message",
                "params": { "level": "info", "data": format!("call {}", invocations) },
            });
            write_line(stdout, &notification);
            success(id, json!({ "content": [], "invocation": invocations }))
        }
        "fail" => error(id, -32000, format!("intentional failure (call {})", invocations)),
        other => error(id, -32602, format!("unknown tool: {}", other)),
    }
}

fn success(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error(id: Value, code: i32, message: String) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

fn write_line(stdout: &mut std::io::Stdout, value: &Value) {
    if let Ok(text) = serde_json::to_string(value) {
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.write_all(b"\n");
        let _ = stdout.flush();
    }
}

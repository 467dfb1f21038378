//! Host-facing JSON-RPC 2.0 over newline-delimited JSON.
//!
//! Each `tools/call` runs on its own task so a slow language server query does
//! not hold up `ping` or other calls. All responses funnel through one writer
//! task. EOF on the input ends the loop once in-flight calls have answered.

use std::sync::Arc;

use anyhow::Context;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use tether_lsp::Bridge;
use tether_tools::ToolRegistry;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

const OUTBOX_CAPACITY: usize = 64;

fn response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() }
    })
}

fn tool_result(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error
    })
}

/// A request that has passed envelope validation.
#[derive(Debug)]
struct Incoming {
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

fn validate(message: Value) -> Result<Incoming, Value> {
    let Value::Object(mut map) = message else {
        return Err(error_response(
            Value::Null,
            INVALID_REQUEST,
            "Invalid Request: expected a JSON object",
        ));
    };
    let id = map.remove("id");
    let reply_id = id.clone().unwrap_or(Value::Null);
    if let Some(id) = &id
        && !(id.is_string() || id.is_number() || id.is_null())
    {
        return Err(error_response(
            Value::Null,
            INVALID_REQUEST,
            "Invalid Request: id must be a string or number",
        ));
    }
    if map.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(error_response(
            reply_id,
            INVALID_REQUEST,
            "Invalid Request: jsonrpc must be \"2.0\"",
        ));
    }
    let Some(Value::String(method)) = map.remove("method") else {
        return Err(error_response(
            reply_id,
            INVALID_REQUEST,
            "Invalid Request: missing method",
        ));
    };
    Ok(Incoming {
        id,
        method,
        params: map.remove("params"),
    })
}

#[derive(Clone)]
struct Handler {
    bridge: Bridge,
    registry: Arc<ToolRegistry>,
}

/// Immediate answer, or a tool call to run in the background.
enum Dispatch {
    Reply(Value),
    Call {
        id: Value,
        name: String,
        arguments: Value,
    },
    Ignore,
}

impl Handler {
    fn dispatch(&self, request: Incoming) -> Dispatch {
        let Some(id) = request.id else {
            tracing::debug!(method = %request.method, "Host notification");
            return Dispatch::Ignore;
        };
        match request.method.as_str() {
            "initialize" => {
                let version = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("protocolVersion"))
                    .and_then(Value::as_str)
                    .unwrap_or(PROTOCOL_VERSION)
                    .to_string();
                Dispatch::Reply(response(
                    id,
                    json!({
                        "protocolVersion": version,
                        "capabilities": { "tools": { "listChanged": false } },
                        "serverInfo": {
                            "name": "tether",
                            "version": env!("CARGO_PKG_VERSION")
                        }
                    }),
                ))
            }
            "ping" => Dispatch::Reply(response(id, json!({}))),
            "tools/list" => Dispatch::Reply(response(
                id,
                json!({ "tools": self.registry.definitions() }),
            )),
            "tools/call" => match call_params(request.params) {
                Ok((name, arguments)) if self.registry.get(&name).is_some() => Dispatch::Call {
                    id,
                    name,
                    arguments,
                },
                Ok((name, _)) => Dispatch::Reply(error_response(
                    id,
                    INVALID_PARAMS,
                    format!("Unknown tool: {name}"),
                )),
                Err(message) => Dispatch::Reply(error_response(id, INVALID_PARAMS, message)),
            },
            other => Dispatch::Reply(error_response(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }

    async fn call(&self, name: &str, arguments: &Value) -> Value {
        match self.registry.call(name, arguments, &self.bridge).await {
            Ok(text) => tool_result(text, false),
            Err(e) => tool_result(e.user_message(), true),
        }
    }
}

fn call_params(params: Option<Value>) -> Result<(String, Value), String> {
    let Some(Value::Object(mut params)) = params else {
        return Err("Invalid params: expected object".to_string());
    };
    let Some(Value::String(name)) = params.remove("name") else {
        return Err("Invalid params: missing 'name'".to_string());
    };
    let arguments = match params.remove("arguments") {
        None | Some(Value::Null) => json!({}),
        Some(args @ Value::Object(_)) => args,
        Some(_) => return Err("Invalid params: 'arguments' must be an object".to_string()),
    };
    Ok((name, arguments))
}

async fn write_responses<W>(mut writer: W, mut outbox: mpsc::Receiver<Value>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbox.recv().await {
        let mut line = message.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Serve host requests from `reader` until EOF.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    bridge: Bridge,
    registry: Arc<ToolRegistry>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
    let writer_task = tokio::spawn(write_responses(writer, rx));
    let handler = Handler { bridge, registry };
    let mut calls = JoinSet::new();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await.context("failed to read from host")? {
        if line.trim().is_empty() {
            continue;
        }
        let message = match serde_json::from_str::<Value>(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable host message");
                let reply = error_response(Value::Null, PARSE_ERROR, format!("Parse error: {e}"));
                if tx.send(reply).await.is_err() {
                    break;
                }
                continue;
            }
        };
        let request = match validate(message) {
            Ok(request) => request,
            Err(reply) => {
                if tx.send(reply).await.is_err() {
                    break;
                }
                continue;
            }
        };
        match handler.dispatch(request) {
            Dispatch::Reply(reply) => {
                if tx.send(reply).await.is_err() {
                    break;
                }
            }
            Dispatch::Call {
                id,
                name,
                arguments,
            } => {
                let handler = handler.clone();
                let tx = tx.clone();
                calls.spawn(async move {
                    let result = handler.call(&name, &arguments).await;
                    let _ = tx.send(response(id, result)).await;
                });
            }
            Dispatch::Ignore => {}
        }
        // Reap finished calls so the set does not grow without bound.
        while calls.try_join_next().is_some() {}
    }

    tracing::info!(in_flight = calls.len(), "Host closed input");
    while calls.join_next().await.is_some() {}
    drop(tx);
    writer_task
        .await
        .context("response writer panicked")?
        .context("failed to write to host")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use tether_lsp::{BridgeConfig, LaunchedServer, ServerConfig, ServerLauncher};
    use tokio::io::AsyncReadExt;

    struct NoServer;

    impl ServerLauncher for NoServer {
        fn launch(&self, _generation: u64) -> anyhow::Result<LaunchedServer> {
            anyhow::bail!("no language server here")
        }
    }

    /// Feed `input` lines, close stdin, and return every response keyed by id.
    async fn exchange(root: &Path, input: &[&str]) -> (HashMap<String, Value>, Vec<Value>) {
        let bridge = Bridge::new(
            BridgeConfig::new(root.to_path_buf(), ServerConfig::new("clangd")),
            NoServer,
        );
        let registry = Arc::new(ToolRegistry::with_lsp_tools());
        let mut script = input.join("\n");
        script.push('\n');
        let (out_writer, mut out_reader) = tokio::io::duplex(1 << 16);

        serve(script.as_bytes(), out_writer, bridge, registry)
            .await
            .unwrap();

        let mut output = String::new();
        out_reader.read_to_string(&mut output).await.unwrap();
        let mut by_id = HashMap::new();
        let mut all = Vec::new();
        for line in output.lines() {
            let value: Value = serde_json::from_str(line).unwrap();
            by_id.insert(value["id"].to_string(), value.clone());
            all.push(value);
        }
        (by_id, all)
    }

    #[tokio::test]
    async fn initialize_and_list_tools() {
        let dir = tempfile::tempdir().unwrap();
        let (replies, all) = exchange(
            dir.path(),
            &[
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26"}}"#,
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
                r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
                r#"{"jsonrpc":"2.0","id":"p","method":"ping"}"#,
            ],
        )
        .await;

        assert_eq!(all.len(), 3, "notifications get no reply");
        let init = &replies["1"]["result"];
        assert_eq!(init["protocolVersion"], "2025-03-26");
        assert_eq!(init["serverInfo"]["name"], "tether");
        assert!(init["capabilities"]["tools"].is_object());

        let tools = replies["2"]["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 9);
        assert!(tools.iter().all(|t| t["inputSchema"]["type"] == "object"));

        assert_eq!(replies["\"p\""]["result"], json!({}));
    }

    #[tokio::test]
    async fn tool_failures_are_results_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (replies, _) = exchange(
            dir.path(),
            &[
                r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"lsp_hover","arguments":{"file":"main.cpp","line":2,"column":3}}}"#,
                r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"lsp_status"}}"#,
                r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"lsp_hover","arguments":{"file":"main.cpp"}}}"#,
            ],
        )
        .await;

        let hover = &replies["1"]["result"];
        assert_eq!(hover["isError"], true);
        let text = hover["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("main.cpp:2:3"), "{text}");
        assert!(text.contains("not started"), "{text}");

        let status = &replies["2"]["result"];
        assert_eq!(status["isError"], false);
        assert!(
            status["content"][0]["text"]
                .as_str()
                .unwrap()
                .starts_with("phase: not started")
        );

        let bad_args = &replies["3"]["result"];
        assert_eq!(bad_args["isError"], true);
        assert!(
            bad_args["content"][0]["text"]
                .as_str()
                .unwrap()
                .contains("Bad tool args")
        );
    }

    #[tokio::test]
    async fn malformed_requests_get_json_rpc_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (replies, all) = exchange(
            dir.path(),
            &[
                "{not json",
                r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#,
                r#"{"jsonrpc":"2.0","id":2,"method":"resources/list"}"#,
                r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"arguments":{}}}"#,
                r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"lsp_definition"}}"#,
                r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"lsp_status","arguments":[1]}}"#,
                r"[1, 2]",
            ],
        )
        .await;

        let codes: Vec<i64> = all
            .iter()
            .map(|reply| reply["error"]["code"].as_i64().unwrap())
            .collect();
        assert_eq!(codes.len(), 7);
        assert_eq!(codes[0], PARSE_ERROR);
        assert_eq!(replies["1"]["error"]["code"], INVALID_REQUEST);
        assert_eq!(replies["2"]["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(replies["3"]["error"]["code"], INVALID_PARAMS);
        assert_eq!(replies["4"]["error"]["code"], INVALID_PARAMS);
        assert!(
            replies["4"]["error"]["message"]
                .as_str()
                .unwrap()
                .contains("lsp_definition")
        );
        assert_eq!(replies["5"]["error"]["code"], INVALID_PARAMS);
        assert_eq!(codes[6], INVALID_REQUEST);
    }

    #[test]
    fn call_params_default_arguments() {
        let (name, args) = call_params(Some(json!({"name": "lsp_status"}))).unwrap();
        assert_eq!(name, "lsp_status");
        assert_eq!(args, json!({}));
        assert!(call_params(None).is_err());
    }
}

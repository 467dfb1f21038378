//! In-process fake language server for bridge tests.
//!
//! Speaks real `Content-Length` framed JSON-RPC over `tokio::io::duplex`
//! pipes. Behaviour is deliberately simple: symbols are `class <Name>`
//! declarations, any line containing `error` produces a diagnostic, and
//! files whose name contains `hang` never get hover answers. While indexing
//! is held, hovers on files whose name contains `slow` are answered only
//! after indexing ends.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tether_lsp::codec::{FrameReader, FrameWriter, ReadEvent};
use tether_lsp::{
    Bridge, BridgeConfig, LaunchedServer, ServerConfig, ServerLauncher, file_uri_to_path,
};
use tokio::sync::{Notify, mpsc, oneshot};

#[derive(Default)]
struct FakeState {
    root: PathBuf,
    launches: AtomicU64,
    hold_indexing: AtomicBool,
    release: Notify,
    deferred: Mutex<Vec<(Value, Value)>>,
    fail_initialize: Mutex<HashSet<u64>>,
    fail_launch: Mutex<HashSet<u64>>,
    received: Mutex<Vec<(u64, Value)>>,
    kills: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    exited: Mutex<Vec<u64>>,
}

/// Handle for inspecting and poking fake servers from a test.
#[derive(Clone)]
pub struct FakeServers {
    state: Arc<FakeState>,
}

impl FakeServers {
    pub fn new(root: &Path) -> Self {
        Self {
            state: Arc::new(FakeState {
                root: root.to_path_buf(),
                ..FakeState::default()
            }),
        }
    }

    pub fn launcher(&self) -> FakeLauncher {
        FakeLauncher {
            state: self.state.clone(),
        }
    }

    /// Keep indexing progress open until [`release_indexing`](Self::release_indexing).
    pub fn hold_indexing(&self) {
        self.state.hold_indexing.store(true, Ordering::SeqCst);
    }

    pub fn release_indexing(&self) {
        self.state.hold_indexing.store(false, Ordering::SeqCst);
        self.state.release.notify_one();
    }

    /// Answer `initialize` from the server of `generation` with an error.
    pub fn fail_initialize_at(&self, generation: u64) {
        self.state.fail_initialize.lock().unwrap().insert(generation);
    }

    /// Make launching `generation` fail before any process exists.
    pub fn fail_launch_at(&self, generation: u64) {
        self.state.fail_launch.lock().unwrap().insert(generation);
    }

    /// Launch attempts, failed ones included.
    pub fn launches(&self) -> u64 {
        self.state.launches.load(Ordering::SeqCst)
    }

    /// Kill the server of `generation` without any LSP goodbye.
    pub fn crash(&self, generation: u64) {
        if let Some(kill) = self.state.kills.lock().unwrap().remove(&generation) {
            let _ = kill.send(());
        }
    }

    pub fn exited(&self, generation: u64) -> bool {
        self.state.exited.lock().unwrap().contains(&generation)
    }

    /// Messages with `method` received by the server of `generation`.
    pub fn received(&self, generation: u64, method: &str) -> Vec<Value> {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .filter(|(g, msg)| *g == generation && msg["method"] == method)
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

pub struct FakeLauncher {
    state: Arc<FakeState>,
}

impl ServerLauncher for FakeLauncher {
    fn launch(&self, generation: u64) -> anyhow::Result<LaunchedServer> {
        self.state.launches.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_launch.lock().unwrap().contains(&generation) {
            anyhow::bail!("fake-ls: spawn refused for generation {generation}");
        }
        let (client, server) = tokio::io::duplex(256 * 1024);
        let (kill_tx, kill_rx) = oneshot::channel();
        self.state
            .kills
            .lock()
            .unwrap()
            .insert(generation, kill_tx);
        tokio::spawn(serve(self.state.clone(), generation, server, kill_rx));
        let (reader, writer) = tokio::io::split(client);
        Ok(LaunchedServer::from_streams(reader, writer))
    }
}

async fn serve(
    state: Arc<FakeState>,
    generation: u64,
    stream: tokio::io::DuplexStream,
    mut kill: oneshot::Receiver<()>,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let writer_task = tokio::spawn(async move {
        let mut writer = FrameWriter::new(write_half);
        while let Some(msg) = out_rx.recv().await {
            if writer.write_frame(&msg).await.is_err() {
                break;
            }
        }
    });

    let mut docs: HashMap<String, String> = HashMap::new();
    loop {
        let event = tokio::select! {
            _ = &mut kill => break,
            event = reader.next_event() => event,
        };
        let msg = match event {
            Ok(ReadEvent::Frame(msg)) => msg,
            Ok(ReadEvent::Malformed(_)) => continue,
            Ok(ReadEvent::Closed) | Err(_) => break,
        };
        state
            .received
            .lock()
            .unwrap()
            .push((generation, msg.clone()));
        if msg["method"] == "exit" {
            break;
        }
        handle(&state, generation, &mut docs, &msg, &out_tx);
    }

    state.exited.lock().unwrap().push(generation);
    writer_task.abort();
}

fn respond(out: &mpsc::UnboundedSender<Value>, id: &Value, result: Value) {
    let _ = out.send(json!({"jsonrpc": "2.0", "id": id, "result": result}));
}

fn notify(out: &mpsc::UnboundedSender<Value>, method: &str, params: Value) {
    let _ = out.send(json!({"jsonrpc": "2.0", "method": method, "params": params}));
}

fn progress(out: &mpsc::UnboundedSender<Value>, value: Value) {
    notify(out, "$/progress", json!({"token": "fake/index", "value": value}));
}

fn handle(
    state: &Arc<FakeState>,
    generation: u64,
    docs: &mut HashMap<String, String>,
    msg: &Value,
    out: &mpsc::UnboundedSender<Value>,
) {
    let Some(method) = msg["method"].as_str() else {
        // Reply to one of our own requests.
        return;
    };
    let id = &msg["id"];
    let params = &msg["params"];

    match method {
        "initialize" if state.fail_initialize.lock().unwrap().contains(&generation) => {
            let _ = out.send(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32603, "message": "fake-ls: cannot index this project"}
            }));
        }
        "initialize" => respond(
            out,
            id,
            json!({
                "capabilities": {
                    "textDocumentSync": 1,
                    "hoverProvider": true,
                    "documentSymbolProvider": true,
                    "workspaceSymbolProvider": true,
                    "completionProvider": {},
                    "documentFormattingProvider": true,
                    "renameProvider": true
                },
                "serverInfo": {"name": "fake-ls", "version": "0.1"}
            }),
        ),
        "initialized" => {
            let _ = out.send(json!({
                "jsonrpc": "2.0",
                "id": "create-1",
                "method": "window/workDoneProgress/create",
                "params": {"token": "fake/index"}
            }));
            progress(out, json!({"kind": "begin", "title": "indexing", "percentage": 0}));
            progress(out, json!({"kind": "report", "message": "1/2 files", "percentage": 50}));
            if state.hold_indexing.load(Ordering::SeqCst) {
                let state = state.clone();
                let out = out.clone();
                tokio::spawn(async move {
                    state.release.notified().await;
                    progress(&out, json!({"kind": "end", "message": "done"}));
                    let deferred = std::mem::take(&mut *state.deferred.lock().unwrap());
                    for (id, result) in deferred {
                        respond(&out, &id, result);
                    }
                });
            } else {
                progress(out, json!({"kind": "end", "message": "done"}));
            }
        }
        "textDocument/didOpen" => {
            let uri = params["textDocument"]["uri"].as_str().unwrap_or_default();
            let text = params["textDocument"]["text"].as_str().unwrap_or_default();
            let version = params["textDocument"]["version"].as_i64().unwrap_or(0);
            docs.insert(uri.to_string(), text.to_string());
            publish(out, uri, version, text);
        }
        "textDocument/didChange" => {
            let uri = params["textDocument"]["uri"].as_str().unwrap_or_default();
            let text = params["contentChanges"][0]["text"]
                .as_str()
                .unwrap_or_default();
            let version = params["textDocument"]["version"].as_i64().unwrap_or(0);
            docs.insert(uri.to_string(), text.to_string());
            publish(out, uri, version, text);
        }
        "textDocument/didClose" => {
            let uri = params["textDocument"]["uri"].as_str().unwrap_or_default();
            docs.remove(uri);
        }
        "textDocument/hover" => {
            let uri = params["textDocument"]["uri"].as_str().unwrap_or_default();
            if uri.contains("hang") {
                return;
            }
            let result = docs
                .get(uri)
                .and_then(|text| word_at(text, &params["position"]))
                .map_or(Value::Null, |(word, line, start, end)| {
                    json!({
                        "contents": {"kind": "markdown", "value": format!("**{word}**")},
                        "range": range(line, start, end)
                    })
                });
            if uri.contains("slow") && state.hold_indexing.load(Ordering::SeqCst) {
                state.deferred.lock().unwrap().push((id.clone(), result));
                return;
            }
            respond(out, id, result);
        }
        "textDocument/documentSymbol" => {
            let uri = params["textDocument"]["uri"].as_str().unwrap_or_default();
            let symbols: Vec<Value> = docs
                .get(uri)
                .map(|text| classes(text))
                .unwrap_or_default()
                .into_iter()
                .map(|(name, line, start)| {
                    let end = start + name.len();
                    json!({
                        "name": name,
                        "kind": 5,
                        "range": range(line, 0, end),
                        "selectionRange": range(line, start, end)
                    })
                })
                .collect();
            respond(out, id, Value::Array(symbols));
        }
        "workspace/symbol" => {
            let query = params["query"].as_str().unwrap_or_default().to_lowercase();
            respond(out, id, Value::Array(workspace_classes(&state.root, &query)));
        }
        "textDocument/completion" => respond(
            out,
            id,
            json!({
                "isIncomplete": false,
                "items": [
                    {"label": "add", "kind": 2, "detail": "int add(int, int)"},
                    {"label": "subtract", "kind": 2}
                ]
            }),
        ),
        "textDocument/formatting" => {
            let uri = params["textDocument"]["uri"].as_str().unwrap_or_default();
            let edits: Vec<Value> = docs
                .get(uri)
                .map(|text| trailing_whitespace_edits(text))
                .unwrap_or_default();
            respond(out, id, Value::Array(edits));
        }
        "textDocument/rename" => {
            let new_name = params["newName"].as_str().unwrap_or_default();
            if new_name.is_empty() {
                let _ = out.send(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32602, "message": "new name must not be empty"}
                }));
                return;
            }
            let uri = params["textDocument"]["uri"].as_str().unwrap_or_default();
            let Some((word, ..)) = docs
                .get(uri)
                .and_then(|text| word_at(text, &params["position"]))
            else {
                respond(out, id, Value::Null);
                return;
            };
            let edits: Vec<Value> = docs[uri]
                .lines()
                .enumerate()
                .flat_map(|(line, text)| {
                    text.match_indices(word.as_str())
                        .map(move |(start, m)| (line, start, start + m.len()))
                        .collect::<Vec<_>>()
                })
                .map(|(line, start, end)| json!({"range": range(line, start, end), "newText": new_name}))
                .collect();
            respond(out, id, json!({"changes": {uri: edits}}));
        }
        "shutdown" => respond(out, id, Value::Null),
        _ if !id.is_null() => {
            let _ = out.send(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("unhandled {method}")}
            }));
        }
        _ => {}
    }
}

fn range(line: usize, start: usize, end: usize) -> Value {
    json!({
        "start": {"line": line, "character": start},
        "end": {"line": line, "character": end}
    })
}

fn publish(out: &mpsc::UnboundedSender<Value>, uri: &str, version: i64, text: &str) {
    let diagnostics: Vec<Value> = text
        .lines()
        .enumerate()
        .filter_map(|(line, content)| {
            let col = content.find("error")?;
            Some(json!({
                "range": range(line, col, col + 5),
                "severity": 1,
                "source": "fake",
                "message": "found an error"
            }))
        })
        .collect();
    notify(
        out,
        "textDocument/publishDiagnostics",
        json!({"uri": uri, "version": version, "diagnostics": diagnostics}),
    );
}

/// Identifier under an ASCII-only position.
fn word_at(text: &str, position: &Value) -> Option<(String, usize, usize, usize)> {
    let line_no = usize::try_from(position["line"].as_u64()?).ok()?;
    let col = usize::try_from(position["character"].as_u64()?).ok()?;
    let line = text.lines().nth(line_no)?;
    let is_ident = |c: u8| c.is_ascii_alphanumeric() || c == b'_';
    let bytes = line.as_bytes();
    if col >= bytes.len() || !is_ident(bytes[col]) {
        return None;
    }
    let start = (0..=col).rev().take_while(|&i| is_ident(bytes[i])).last()?;
    let end = (col..bytes.len())
        .take_while(|&i| is_ident(bytes[i]))
        .last()?
        + 1;
    Some((line[start..end].to_string(), line_no, start, end))
}

fn classes(text: &str) -> Vec<(String, usize, usize)> {
    text.lines()
        .enumerate()
        .filter_map(|(line, content)| {
            let idx = content.find("class ")?;
            let start = idx + "class ".len();
            let name: String = content[start..]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            (!name.is_empty()).then_some((name, line, start))
        })
        .collect()
}

fn workspace_classes(root: &Path, query: &str) -> Vec<Value> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Ok(uri) = url::Url::from_file_path(&path) else {
            continue;
        };
        for (name, line, start) in classes(&text) {
            if name.to_lowercase().contains(query) {
                out.push(json!({
                    "name": name,
                    "kind": 5,
                    "location": {"uri": uri.as_str(), "range": range(line, start, start + name.len())}
                }));
            }
        }
    }
    out
}

fn trailing_whitespace_edits(text: &str) -> Vec<Value> {
    text.lines()
        .enumerate()
        .filter_map(|(line, content)| {
            let trimmed = content.trim_end().len();
            (trimmed < content.len()).then(|| {
                json!({"range": range(line, trimmed, content.len()), "newText": ""})
            })
        })
        .collect()
}

/// Config tuned for fast tests.
pub fn test_config(root: &Path) -> BridgeConfig {
    let mut config = BridgeConfig::new(root.to_path_buf(), ServerConfig::new("fake-ls"));
    config.request_timeout = Duration::from_secs(2);
    config.ready_timeout = Duration::from_secs(5);
    config.shutdown_grace = Duration::from_millis(500);
    config.diagnostics_settle = Duration::from_secs(1);
    config
}

/// A workspace with a `Calculator` class, plus the fake servers serving it.
pub fn workspace() -> (tempfile::TempDir, FakeServers) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("calculator.cpp"),
        "class Calculator {\npublic:\n  int add(int a, int b);\n};\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("main.cpp"),
        "int main() {\n  Calculator calc;\n  return 0;\n}\n",
    )
    .unwrap();
    // Canonical root so paths match what the bridge resolves.
    let root = std::fs::canonicalize(dir.path()).unwrap();
    let servers = FakeServers::new(&root);
    (dir, servers)
}

pub async fn start(servers: &FakeServers, config: BridgeConfig) -> Bridge {
    Bridge::start(config, servers.launcher()).await.unwrap()
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn uri_path(uri: &Value) -> Option<PathBuf> {
    uri.as_str().and_then(file_uri_to_path)
}

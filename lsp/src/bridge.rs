//! Bridge facade, the one handle the tool layer talks to.
//!
//! Every semantic operation follows the same path: wait until readiness
//! allows it, sync the target document, issue one request with the
//! configured timeout, and normalize the answer into a [`Reply`] that carries
//! the readiness phase it was produced in.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::correlator::{Correlator, Subscriptions};
use crate::diagnostics::DiagnosticsStore;
use crate::documents::{DocumentSync, SyncOutcome};
use crate::edits;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol;
use crate::readiness::ReadinessTracker;
use crate::results;
use crate::supervisor::{self, ServerLauncher, StdioLauncher};
use crate::types::{
    BridgeConfig, BridgeStatus, CompletionEntry, Diagnostic, FileEdits, Formatted,
    FormattingOptions, HoverInfo, Outcome, Position, ReadinessState, Reply, Symbol,
};

/// State shared between the facade and the supervisor task.
pub(crate) struct Shared {
    pub config: BridgeConfig,
    pub readiness: Arc<ReadinessTracker>,
    pub documents: DocumentSync,
    pub diagnostics: Arc<DiagnosticsStore>,
    active: RwLock<Option<Arc<Correlator>>>,
    restarts: AtomicU32,
    generation: AtomicU64,
    server_name: Mutex<Option<String>>,
}

impl Shared {
    fn new(config: BridgeConfig) -> Self {
        Self {
            readiness: Arc::new(ReadinessTracker::new(config.max_restart_attempts)),
            documents: DocumentSync::default(),
            diagnostics: Arc::new(DiagnosticsStore::new(&config.project_root)),
            active: RwLock::new(None),
            restarts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            server_name: Mutex::new(None),
            config,
        }
    }

    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn bump_restarts(&self) -> u32 {
        self.restarts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn activate(&self, rpc: Arc<Correlator>) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(rpc);
    }

    pub fn deactivate(&self) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn rpc(&self) -> Option<Arc<Correlator>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn record_initialize_result(&self, result: &serde_json::Value) {
        let name = result.get("serverInfo").and_then(|info| {
            let name = info.get("name")?.as_str()?;
            Some(match info.get("version").and_then(|v| v.as_str()) {
                Some(version) => format!("{name} {version}"),
                None => name.to_string(),
            })
        });
        *self
            .server_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = name;
    }

    /// Notification handlers for a new session.
    pub fn subscriptions(&self) -> Subscriptions {
        let mut subs = Subscriptions::default();

        let readiness = self.readiness.clone();
        subs.on("$/progress", move |params| readiness.on_progress(params));

        let readiness = self.readiness.clone();
        subs.on("experimental/serverStatus", move |params| {
            readiness.on_server_status(params);
        });

        let diagnostics = self.diagnostics.clone();
        subs.on("textDocument/publishDiagnostics", move |params| {
            diagnostics.ingest(params);
        });

        subs.on("window/logMessage", log_server_message);
        subs.on("window/showMessage", log_server_message);
        subs
    }
}

fn log_server_message(params: Option<&serde_json::Value>) {
    let Some(params) = params else { return };
    let message = params
        .get("message")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    match params.get("type").and_then(serde_json::Value::as_u64) {
        Some(1) => tracing::error!(target: "tether_lsp::server", "{message}"),
        Some(2) => tracing::warn!(target: "tether_lsp::server", "{message}"),
        Some(3) => tracing::info!(target: "tether_lsp::server", "{message}"),
        _ => tracing::debug!(target: "tether_lsp::server", "{message}"),
    }
}

struct SupervisorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    shared: Arc<Shared>,
    launcher: Arc<dyn ServerLauncher>,
    supervisor: tokio::sync::Mutex<Option<SupervisorHandle>>,
}

/// A file synced to the server for the current request.
struct SyncedDocument {
    path: PathBuf,
    uri: String,
    text: String,
    sync: SyncOutcome,
}

/// Cheaply cloneable handle to one language server bridge.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    /// Create a bridge without starting the server.
    pub fn new(config: BridgeConfig, launcher: impl ServerLauncher) -> Self {
        let config = absolute_root(config);
        Self {
            inner: Arc::new(Inner {
                shared: Arc::new(Shared::new(config)),
                launcher: Arc::new(launcher),
                supervisor: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Create a bridge for the configured executable, resolving it now.
    pub fn stdio(config: BridgeConfig) -> BridgeResult<Self> {
        let config = absolute_root(config);
        let launcher = StdioLauncher::new(&config).map_err(BridgeError::Launch)?;
        Ok(Self::new(config, launcher))
    }

    /// Create a bridge and launch the first server process.
    pub async fn start(config: BridgeConfig, launcher: impl ServerLauncher) -> BridgeResult<Self> {
        let bridge = Self::new(config, launcher);
        bridge.launch().await?;
        Ok(bridge)
    }

    /// Launch the server and start supervising it. No-op if already running.
    pub async fn launch(&self) -> BridgeResult<()> {
        let mut slot = self.inner.supervisor.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let shared = &self.inner.shared;
        shared.restarts.store(0, Ordering::SeqCst);
        shared.readiness.begin_session();

        let session = match supervisor::launch_session(shared, self.inner.launcher.as_ref()) {
            Ok(session) => session,
            Err(e) => {
                shared.readiness.reset();
                return Err(BridgeError::Launch(e));
            }
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(supervisor::run(
            shared.clone(),
            self.inner.launcher.clone(),
            session,
            stop_rx,
        ));
        *slot = Some(SupervisorHandle { stop_tx, task });
        Ok(())
    }

    /// Stop the server gracefully. Safe to call any number of times.
    pub async fn shutdown(&self) {
        let handle = self.inner.supervisor.lock().await.take();
        let Some(handle) = handle else {
            return;
        };
        let _ = handle.stop_tx.send(true);
        if let Err(e) = handle.task.await {
            tracing::warn!("Supervisor task ended abnormally: {e}");
        }
        self.inner.shared.readiness.reset();
        tracing::info!("Bridge shut down");
    }

    /// Shut down and start over with a fresh restart budget.
    pub async fn restart(&self) -> BridgeResult<()> {
        self.shutdown().await;
        self.launch().await
    }

    /// Wait for full readiness (indexing finished), ignoring fast-start.
    pub async fn await_ready(&self, timeout: Duration) -> BridgeResult<ReadinessState> {
        self.inner
            .shared
            .readiness
            .wait_usable(false, timeout)
            .await
    }

    #[must_use]
    pub fn readiness(&self) -> ReadinessState {
        self.inner.shared.readiness.state()
    }

    #[must_use]
    pub fn subscribe_readiness(&self) -> watch::Receiver<ReadinessState> {
        self.inner.shared.readiness.subscribe()
    }

    /// Phase transitions, oldest first (bounded).
    #[must_use]
    pub fn readiness_history(&self) -> Vec<ReadinessState> {
        self.inner.shared.readiness.history()
    }

    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.shared.config
    }

    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.inner.shared.config.project_root
    }

    pub async fn status(&self) -> BridgeStatus {
        let shared = &self.inner.shared;
        let pending_requests = match shared.rpc() {
            Some(rpc) => rpc.pending_len().await,
            None => 0,
        };
        BridgeStatus {
            phase: shared.readiness.state(),
            restarts: shared.restarts(),
            max_restart_attempts: shared.config.max_restart_attempts,
            generation: shared.generation.load(Ordering::SeqCst),
            open_documents: shared.documents.len(),
            pending_requests,
            indexing_message: shared.readiness.message(),
            server_name: shared
                .server_name
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            fast_start: shared.config.fast_start,
        }
    }

    pub async fn hover(&self, path: &Path, position: Position) -> BridgeResult<Reply<HoverInfo>> {
        const METHOD: &str = "textDocument/hover";
        let (rpc, issued) = self.gate(METHOD).await?;
        let doc = self.sync_document(&rpc, path).await?;
        let result = self
            .request(&rpc, METHOD, protocol::position_params(&doc.uri, position))
            .await?;
        Ok(self.reply(issued, results::hover(&result)))
    }

    pub async fn document_symbols(&self, path: &Path) -> BridgeResult<Reply<Vec<Symbol>>> {
        const METHOD: &str = "textDocument/documentSymbol";
        let (rpc, issued) = self.gate(METHOD).await?;
        let doc = self.sync_document(&rpc, path).await?;
        let result = self
            .request(&rpc, METHOD, protocol::document_params(&doc.uri))
            .await?;
        Ok(self.reply_list(issued, results::document_symbols(&result)))
    }

    /// Search symbols across the workspace.
    ///
    /// A blank query answers empty without asking the server. Results found
    /// before indexing completes are flagged partial.
    pub async fn workspace_symbols(&self, query: &str) -> BridgeResult<Reply<Vec<Symbol>>> {
        const METHOD: &str = "workspace/symbol";
        if query.trim().is_empty() {
            let phase = self.readiness();
            return match phase {
                ReadinessState::Failed => Err(BridgeError::RestartsExhausted {
                    attempts: self.inner.shared.config.max_restart_attempts,
                }),
                ReadinessState::NotStarted => Err(BridgeError::NotStarted),
                phase => Ok(Reply::empty(phase)),
            };
        }
        let (rpc, issued) = self.gate(METHOD).await?;
        let result = self
            .request(&rpc, METHOD, protocol::workspace_symbol_params(query))
            .await?;
        Ok(self.reply_list(issued, results::workspace_symbols(&result)))
    }

    /// Diagnostics pushed for `path` after syncing its current content.
    pub async fn diagnostics(&self, path: &Path) -> BridgeResult<Reply<Vec<Diagnostic>>> {
        let (rpc, issued) = self.gate("textDocument/publishDiagnostics").await?;
        let store = &self.inner.shared.diagnostics;
        let before = store.seq();
        let doc = self.sync_document(&rpc, path).await?;
        let after_seq = doc.sync.sent().then_some(before);
        let items = store
            .wait_for(
                &doc.path,
                doc.sync.version(),
                after_seq,
                self.inner.shared.config.diagnostics_settle,
            )
            .await;
        Ok(self.reply_list(issued, items))
    }

    pub async fn completion(
        &self,
        path: &Path,
        position: Position,
    ) -> BridgeResult<Reply<Vec<CompletionEntry>>> {
        const METHOD: &str = "textDocument/completion";
        let (rpc, issued) = self.gate(METHOD).await?;
        let doc = self.sync_document(&rpc, path).await?;
        let result = self
            .request(&rpc, METHOD, protocol::position_params(&doc.uri, position))
            .await?;
        Ok(self.reply_list(issued, results::completion(&result)))
    }

    /// Formatting edits plus the text they produce. The file is not written.
    pub async fn formatting(
        &self,
        path: &Path,
        options: FormattingOptions,
    ) -> BridgeResult<Reply<Formatted>> {
        const METHOD: &str = "textDocument/formatting";
        let (rpc, issued) = self.gate(METHOD).await?;
        let doc = self.sync_document(&rpc, path).await?;
        let result = self
            .request(&rpc, METHOD, protocol::formatting_params(&doc.uri, options))
            .await?;
        let edits = results::text_edits(&result);
        if edits.is_empty() {
            return Ok(self.reply(issued, None));
        }
        let text = edits::apply_text_edits(&doc.text, &edits).map_err(|e| {
            BridgeError::InvalidResponse {
                method: METHOD.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(self.reply(issued, Some(Formatted { edits, text })))
    }

    /// Edits a rename would make, per file. Nothing is written.
    pub async fn rename(
        &self,
        path: &Path,
        position: Position,
        new_name: &str,
    ) -> BridgeResult<Reply<Vec<FileEdits>>> {
        const METHOD: &str = "textDocument/rename";
        let (rpc, issued) = self.gate(METHOD).await?;
        let doc = self.sync_document(&rpc, path).await?;
        let result = self
            .request(
                &rpc,
                METHOD,
                protocol::rename_params(&doc.uri, position, new_name),
            )
            .await?;
        Ok(self.reply_list(issued, results::workspace_edit(&result)))
    }

    /// Send `didClose` for `path`. Returns false if it was not open.
    pub async fn close_document(&self, path: &Path) -> BridgeResult<bool> {
        let shared = &self.inner.shared;
        let path = self.resolve_path(path).await?;
        let Some(rpc) = shared.rpc() else {
            return match shared.readiness.state() {
                ReadinessState::Failed => Err(BridgeError::RestartsExhausted {
                    attempts: shared.config.max_restart_attempts,
                }),
                ReadinessState::NotStarted => Err(BridgeError::NotStarted),
                _ => Ok(false),
            };
        };
        let uri = file_uri(&path)?;
        shared.documents.close(&rpc, &uri).await
    }

    /// Wait until requests may be served. Returns the session and the phase
    /// the request is issued in.
    async fn gate(&self, method: &str) -> BridgeResult<(Arc<Correlator>, ReadinessState)> {
        let shared = &self.inner.shared;
        let issued = shared
            .readiness
            .wait_usable(shared.config.fast_start, shared.config.ready_timeout)
            .await?;
        let rpc = shared.rpc().ok_or_else(|| BridgeError::SessionLost {
            method: method.to_string(),
        })?;
        Ok((rpc, issued))
    }

    async fn request(
        &self,
        rpc: &Correlator,
        method: &str,
        params: serde_json::Value,
    ) -> BridgeResult<serde_json::Value> {
        rpc.request(method, Some(params), self.inner.shared.config.request_timeout)
            .await
    }

    /// Absolute path inside the project root. Relative paths are taken from
    /// the root; symlinks are resolved when the file exists.
    async fn resolve_path(&self, path: &Path) -> BridgeResult<PathBuf> {
        let root = &self.inner.shared.config.project_root;
        let candidate = protocol::normalize_path(&root.join(path));
        let resolved = tokio::fs::canonicalize(&candidate)
            .await
            .unwrap_or(candidate);
        if !resolved.starts_with(root) {
            return Err(BridgeError::InvalidPath {
                path: path.to_path_buf(),
                reason: format!("outside project root {}", root.display()),
            });
        }
        Ok(resolved)
    }

    async fn sync_document(&self, rpc: &Correlator, path: &Path) -> BridgeResult<SyncedDocument> {
        let shared = &self.inner.shared;
        let path = self.resolve_path(path).await?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| BridgeError::Io {
                path: path.clone(),
                source,
            })?;
        let uri = file_uri(&path)?;
        let language_id = shared.config.server.language_id_for(&path);
        let sync = shared
            .documents
            .ensure_open(rpc, &uri, &language_id, &text)
            .await?;
        Ok(SyncedDocument {
            path,
            uri,
            text,
            sync,
        })
    }

    /// An answer computed from a request issued before `Ready` stays partial
    /// even if indexing finished while it was in flight.
    fn reply<T>(&self, issued: ReadinessState, value: Option<T>) -> Reply<T> {
        let outcome = match value {
            Some(value) => Outcome::Found(value),
            None => Outcome::Empty,
        };
        let phase = if issued.is_ready() {
            self.readiness()
        } else {
            issued
        };
        if !phase.is_ready() {
            tracing::debug!(%phase, "Serving reply before indexing finished");
        }
        Reply::new(outcome, phase)
    }

    fn reply_list<T>(&self, issued: ReadinessState, items: Vec<T>) -> Reply<Vec<T>> {
        self.reply(issued, (!items.is_empty()).then_some(items))
    }
}

fn file_uri(path: &Path) -> BridgeResult<String> {
    protocol::path_to_file_uri(path)
        .map(|uri| uri.to_string())
        .map_err(|e| BridgeError::InvalidPath {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Make the project root absolute and symlink-free so it can be compared
/// with paths the server reports.
fn absolute_root(mut config: BridgeConfig) -> BridgeConfig {
    let root = if config.project_root.is_absolute() {
        config.project_root.clone()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&config.project_root))
            .unwrap_or_else(|_| config.project_root.clone())
    };
    config.project_root =
        std::fs::canonicalize(&root).unwrap_or_else(|_| protocol::normalize_path(&root));
    config
}

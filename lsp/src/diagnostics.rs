//! Diagnostics store. Accumulates per-file diagnostics pushed by the server.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::protocol::{self, PublishDiagnosticsParams};
use crate::types::Diagnostic;

struct Published {
    /// Document version the server computed these for, if it said.
    version: Option<i32>,
    /// Store-wide arrival order.
    seq: u64,
    items: Vec<Diagnostic>,
}

#[derive(Default)]
struct StoreData {
    files: HashMap<PathBuf, Published>,
    seq: u64,
}

pub(crate) struct DiagnosticsStore {
    root: PathBuf,
    data: Mutex<StoreData>,
    changed: watch::Sender<u64>,
}

impl DiagnosticsStore {
    pub fn new(root: &Path) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            root: protocol::normalize_path(root),
            data: Mutex::new(StoreData::default()),
            changed,
        }
    }

    /// Apply a `textDocument/publishDiagnostics` notification.
    pub fn ingest(&self, params: Option<&serde_json::Value>) {
        let Some(params) = params else { return };
        let params = match serde_json::from_value::<PublishDiagnosticsParams>(params.clone()) {
            Ok(params) => params,
            Err(e) => {
                tracing::debug!("Failed to parse publishDiagnostics: {e}");
                return;
            }
        };
        let Some(path) = protocol::file_uri_to_path(&params.uri) else {
            tracing::debug!(uri = %params.uri, "publishDiagnostics for non-file URI");
            return;
        };
        let path = protocol::normalize_path(&path);
        if !path.starts_with(&self.root) {
            tracing::warn!(
                "Language server reported diagnostics for path outside workspace: {}",
                path.display()
            );
            return;
        }

        let items: Vec<Diagnostic> = params
            .diagnostics
            .iter()
            .map(protocol::LspDiagnostic::to_diagnostic)
            .collect();
        tracing::debug!(path = %path.display(), count = items.len(), version = ?params.version, "Diagnostics published");
        self.update(path, params.version, items);
    }

    fn update(&self, path: PathBuf, version: Option<i32>, items: Vec<Diagnostic>) {
        let seq = {
            let mut data = self.data();
            data.seq += 1;
            let seq = data.seq;
            // An empty push is recorded so waiters see the file was checked.
            data.files.insert(
                path,
                Published {
                    version,
                    seq,
                    items,
                },
            );
            seq
        };
        self.changed.send_replace(seq);
    }

    /// Current arrival counter; pushes after this point have a larger seq.
    pub fn seq(&self) -> u64 {
        self.data().seq
    }

    pub fn get(&self, path: &Path) -> Vec<Diagnostic> {
        self.data()
            .files
            .get(path)
            .map(|published| published.items.clone())
            .unwrap_or_default()
    }

    /// Wait up to `settle` for diagnostics reflecting `version` of `path`.
    ///
    /// A push satisfies the wait when it names a version at or after
    /// `version`, or, for servers that omit versions, when it arrived after
    /// `after_seq`. `after_seq = None` accepts any stored push. Returns what
    /// is stored when the wait ends, which may be empty.
    pub async fn wait_for(
        &self,
        path: &Path,
        version: i32,
        after_seq: Option<u64>,
        settle: Duration,
    ) -> Vec<Diagnostic> {
        let mut rx = self.changed.subscribe();
        let deadline = Instant::now() + settle;
        loop {
            if let Some(items) = self.satisfied(path, version, after_seq) {
                return items;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }
        tracing::debug!(path = %path.display(), version, "No fresh diagnostics within settle window");
        self.get(path)
    }

    fn satisfied(&self, path: &Path, version: i32, after_seq: Option<u64>) -> Option<Vec<Diagnostic>> {
        let data = self.data();
        let published = data.files.get(path)?;
        let fresh = match (published.version, after_seq) {
            (Some(v), _) => v >= version,
            (None, Some(after)) => published.seq > after,
            (None, None) => true,
        };
        fresh.then(|| published.items.clone())
    }

    /// Forget everything; used when the server process is replaced.
    pub fn clear(&self) {
        let seq = {
            let mut data = self.data();
            data.files.clear();
            data.seq += 1;
            data.seq
        };
        self.changed.send_replace(seq);
    }

    pub fn file_count(&self) -> usize {
        self.data()
            .files
            .values()
            .filter(|published| !published.items.is_empty())
            .count()
    }

    fn data(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

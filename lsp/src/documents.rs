//! Open-document bookkeeping.
//!
//! A document is synced at most once per content change: the first access
//! sends `didOpen` (version 1), later accesses with different content send a
//! full-text `didChange` with the next version, identical content sends
//! nothing. Syncs for the same URI are serialized; unrelated URIs proceed in
//! parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};

use crate::correlator::Correlator;
use crate::error::BridgeResult;
use crate::protocol;

struct OpenDocument {
    synced_version: i32,
    content_hash: [u8; 32],
    /// Session the `didOpen` went to. Records from older sessions are stale.
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncOutcome {
    Opened,
    Changed { version: i32 },
    Unchanged { version: i32 },
}

impl SyncOutcome {
    pub fn version(self) -> i32 {
        match self {
            Self::Opened => 1,
            Self::Changed { version } | Self::Unchanged { version } => version,
        }
    }

    /// Whether the server was sent new content.
    pub fn sent(self) -> bool {
        !matches!(self, Self::Unchanged { .. })
    }
}

#[derive(Default)]
pub(crate) struct DocumentSync {
    records: Mutex<HashMap<String, OpenDocument>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

fn content_hash(text: &str) -> [u8; 32] {
    Sha256::digest(text.as_bytes()).into()
}

impl DocumentSync {
    /// Make the server's view of `uri` match `text`.
    pub async fn ensure_open(
        &self,
        rpc: &Correlator,
        uri: &str,
        language_id: &str,
        text: &str,
    ) -> BridgeResult<SyncOutcome> {
        let lock = self.uri_lock(uri);
        let _guard = lock.lock().await;

        let hash = content_hash(text);
        let existing = self
            .records()
            .get(uri)
            .filter(|record| record.generation == rpc.generation())
            .map(|record| (record.synced_version, record.content_hash));

        match existing {
            Some((version, known)) if known == hash => Ok(SyncOutcome::Unchanged { version }),
            Some((version, _)) => {
                let next = version + 1;
                rpc.notify(
                    "textDocument/didChange",
                    Some(protocol::did_change_params(uri, next, text)),
                )
                .await?;
                self.records().insert(
                    uri.to_string(),
                    OpenDocument {
                        synced_version: next,
                        content_hash: hash,
                        generation: rpc.generation(),
                    },
                );
                tracing::debug!(uri, version = next, "didChange");
                Ok(SyncOutcome::Changed { version: next })
            }
            None => {
                rpc.notify(
                    "textDocument/didOpen",
                    Some(protocol::did_open_params(uri, language_id, 1, text)),
                )
                .await?;
                self.records().insert(
                    uri.to_string(),
                    OpenDocument {
                        synced_version: 1,
                        content_hash: hash,
                        generation: rpc.generation(),
                    },
                );
                tracing::debug!(uri, language_id, "didOpen");
                Ok(SyncOutcome::Opened)
            }
        }
    }

    /// Send `didClose` and forget the record. Returns false if `uri` was not open.
    pub async fn close(&self, rpc: &Correlator, uri: &str) -> BridgeResult<bool> {
        let lock = self.uri_lock(uri);
        let closed = {
            let _guard = lock.lock().await;
            self.close_locked(rpc, uri).await
        };
        self.release_lock(uri, &lock);
        closed
    }

    async fn close_locked(&self, rpc: &Correlator, uri: &str) -> BridgeResult<bool> {
        let Some(record) = self.records().remove(uri) else {
            return Ok(false);
        };
        if record.generation != rpc.generation() {
            return Ok(false);
        }
        rpc.notify(
            "textDocument/didClose",
            Some(protocol::did_close_params(uri)),
        )
        .await?;
        tracing::debug!(uri, "didClose");
        Ok(true)
    }

    /// Drop every record; the new process has never seen these files.
    pub fn invalidate_all(&self) -> usize {
        let mut records = self.records();
        let count = records.len();
        records.clear();
        drop(records);
        self.locks().retain(|_, lock| Arc::strong_count(lock) > 1);
        count
    }

    pub fn synced_version(&self, uri: &str) -> Option<i32> {
        self.records().get(uri).map(|record| record.synced_version)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    fn uri_lock(&self, uri: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks().entry(uri.to_string()).or_default().clone()
    }

    /// Drop the map entry for `uri` if `lock` is its only outside handle.
    fn release_lock(&self, uri: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks();
        let idle = locks
            .get(uri)
            .is_some_and(|entry| Arc::ptr_eq(entry, lock) && Arc::strong_count(lock) == 2);
        if idle {
            locks.remove(uri);
        }
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks().len()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, OpenDocument>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

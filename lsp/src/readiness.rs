//! Readiness tracking: handshake, indexing progress and the gate every
//! semantic request passes through.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{BridgeError, BridgeResult};
use crate::types::{ReadinessSignal, ReadinessState};

const HISTORY_LIMIT: usize = 64;

#[derive(Default)]
struct Progress {
    /// Work-done tokens that began and have not ended, with their last percentage.
    active: HashMap<String, Option<u8>>,
    seen_begin: bool,
    quiescent: bool,
    message: Option<String>,
    history: VecDeque<ReadinessState>,
}

impl Progress {
    fn clear_session(&mut self) {
        self.active.clear();
        self.seen_begin = false;
        self.quiescent = false;
        self.message = None;
    }

    fn indexing_done(&self) -> bool {
        self.quiescent || (self.seen_begin && self.active.is_empty())
    }

    fn percent(&self) -> Option<u8> {
        self.active.values().flatten().copied().min()
    }
}

pub(crate) struct ReadinessTracker {
    tx: watch::Sender<ReadinessState>,
    progress: Mutex<Progress>,
    max_restart_attempts: u32,
}

impl ReadinessTracker {
    pub fn new(max_restart_attempts: u32) -> Self {
        let (tx, _) = watch::channel(ReadinessState::NotStarted);
        let mut progress = Progress::default();
        progress.history.push_back(ReadinessState::NotStarted);
        Self {
            tx,
            progress: Mutex::new(progress),
            max_restart_attempts,
        }
    }

    pub fn state(&self) -> ReadinessState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.tx.subscribe()
    }

    pub fn history(&self) -> Vec<ReadinessState> {
        self.lock().history.iter().copied().collect()
    }

    pub fn message(&self) -> Option<String> {
        self.lock().message.clone()
    }

    /// A new process was launched; progress from the old one is forgotten.
    pub fn begin_session(&self) {
        let mut progress = self.lock();
        progress.clear_session();
        self.transition(&mut progress, ReadinessState::Handshaking);
    }

    /// initialize/initialized exchange finished.
    pub fn handshake_complete(&self, signal: ReadinessSignal) {
        let mut progress = self.lock();
        if self.state() != ReadinessState::Handshaking {
            return;
        }
        let next = if signal == ReadinessSignal::Handshake || progress.indexing_done() {
            ReadinessState::Ready
        } else {
            ReadinessState::Indexing {
                percent: progress.percent(),
            }
        };
        self.transition(&mut progress, next);
    }

    /// Apply a `$/progress` notification.
    pub fn on_progress(&self, params: Option<&serde_json::Value>) {
        let Some(params) = params else { return };
        let Some(token) = params.get("token") else {
            return;
        };
        let token = token.to_string();
        let value = params.get("value");
        let kind = value
            .and_then(|v| v.get("kind"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let percent = value
            .and_then(|v| v.get("percentage"))
            .and_then(serde_json::Value::as_u64)
            .map(|p| u8::try_from(p.min(100)).unwrap_or(100));
        let message = value.and_then(|v| {
            v.get("message")
                .or_else(|| v.get("title"))
                .and_then(serde_json::Value::as_str)
                .map(String::from)
        });

        let mut progress = self.lock();
        match kind {
            "begin" => {
                progress.seen_begin = true;
                progress.active.insert(token, percent);
            }
            "report" => {
                if let Some(slot) = progress.active.get_mut(&token)
                    && percent.is_some()
                {
                    *slot = percent;
                }
            }
            "end" => {
                progress.active.remove(&token);
            }
            _ => return,
        }
        if message.is_some() {
            progress.message = message;
        }

        if let ReadinessState::Indexing { .. } = self.state() {
            let next = if progress.indexing_done() {
                ReadinessState::Ready
            } else {
                ReadinessState::Indexing {
                    percent: progress.percent(),
                }
            };
            self.transition(&mut progress, next);
        }
    }

    /// Apply an `experimental/serverStatus` notification.
    pub fn on_server_status(&self, params: Option<&serde_json::Value>) {
        let quiescent = params
            .and_then(|p| p.get("quiescent"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let mut progress = self.lock();
        progress.quiescent = quiescent;
        if quiescent && matches!(self.state(), ReadinessState::Indexing { .. }) {
            self.transition(&mut progress, ReadinessState::Ready);
        }
    }

    /// Handshake failed on a live process; a restart is coming.
    pub fn degrade(&self) {
        let mut progress = self.lock();
        self.transition(&mut progress, ReadinessState::Degraded);
    }

    pub fn fail(&self) {
        let mut progress = self.lock();
        self.transition(&mut progress, ReadinessState::Failed);
    }

    pub fn reset(&self) {
        let mut progress = self.lock();
        progress.clear_session();
        self.transition(&mut progress, ReadinessState::NotStarted);
    }

    /// Wait until requests may be served, failing fast on terminal states.
    pub async fn wait_usable(
        &self,
        fast_start: bool,
        timeout: Duration,
    ) -> BridgeResult<ReadinessState> {
        let mut rx = self.tx.subscribe();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    ReadinessState::Failed => {
                        return Err(BridgeError::RestartsExhausted {
                            attempts: self.max_restart_attempts,
                        });
                    }
                    ReadinessState::NotStarted => return Err(BridgeError::NotStarted),
                    state if state.is_usable(fast_start) => return Ok(state),
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(BridgeError::NotStarted);
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::NotReady {
                phase: self.state(),
                waited: timeout,
            }),
        }
    }

    fn transition(&self, progress: &mut Progress, next: ReadinessState) {
        let previous = self.state();
        if previous == next {
            return;
        }
        if std::mem::discriminant(&previous) != std::mem::discriminant(&next) {
            tracing::info!(from = %previous, to = %next, "Readiness changed");
            if progress.history.len() == HISTORY_LIMIT {
                progress.history.pop_front();
            }
            progress.history.push_back(next);
        }
        self.tx.send_replace(next);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

//! Request/response correlation for one server session.
//!
//! Every outbound request gets a fresh id and a deadline task. Whichever of
//! {matching response, deadline} happens first removes the pending entry and
//! settles the caller; the other finds nothing to do. Callers that stop
//! waiting leave their entry to the deadline task.
//!
//! Nothing here waits on the writer channel without a bound: a server that
//! stops reading its stdin fills the channel, and callers then time out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{self, IncomingFrame, Notification, Request};
use crate::types::DEFAULT_REQUEST_TIMEOUT;

pub(crate) const WRITER_CHANNEL_CAPACITY: usize = 64;

pub(crate) enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

pub(crate) type NotificationHandler = Arc<dyn Fn(Option<&serde_json::Value>) + Send + Sync>;

/// Notification method → handlers. Built fresh for every session.
#[derive(Default)]
pub(crate) struct Subscriptions {
    handlers: HashMap<String, Vec<NotificationHandler>>,
}

impl Subscriptions {
    pub fn on(
        &mut self,
        method: &str,
        handler: impl Fn(Option<&serde_json::Value>) + Send + Sync + 'static,
    ) {
        self.handlers
            .entry(method.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Returns false when nobody subscribed to `method`.
    pub fn dispatch(&self, method: &str, params: Option<&serde_json::Value>) -> bool {
        let Some(handlers) = self.handlers.get(method) else {
            return false;
        };
        for handler in handlers {
            handler(params);
        }
        true
    }
}

struct PendingRequest {
    method: String,
    issued_at: Instant,
    tx: oneshot::Sender<BridgeResult<serde_json::Value>>,
    timer: AbortHandle,
}

struct PendingState {
    requests: HashMap<u64, PendingRequest>,
    closed: bool,
}

pub(crate) struct Correlator {
    generation: u64,
    next_id: AtomicU64,
    pending: Arc<Mutex<PendingState>>,
    writer_tx: mpsc::Sender<WriterCommand>,
    subscriptions: Subscriptions,
    /// Longest a notification may wait for room in the writer channel.
    send_timeout: Duration,
}

impl Correlator {
    pub fn new(
        generation: u64,
        writer_tx: mpsc::Sender<WriterCommand>,
        subscriptions: Subscriptions,
    ) -> Self {
        Self {
            generation,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(PendingState {
                requests: HashMap::new(),
                closed: false,
            })),
            writer_tx,
            subscriptions,
            send_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Send a request and wait for its result (the response's `result` member).
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> BridgeResult<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_value(Request::new(id, method, params))
            .map_err(|e| BridgeError::Transport(format!("serializing {method}: {e}")))?;

        let (tx, rx) = oneshot::channel();
        let issued_at = Instant::now();
        let deadline = issued_at + timeout;
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(BridgeError::SessionLost {
                    method: method.to_string(),
                });
            }
            let timer = tokio::spawn(expire(
                Arc::downgrade(&self.pending),
                self.writer_tx.clone(),
                id,
                deadline,
            ))
            .abort_handle();
            pending.requests.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    issued_at,
                    tx,
                    timer,
                },
            );
        }

        tracing::trace!(id, method, generation = self.generation, "LSP request");
        let enqueued =
            tokio::time::timeout_at(deadline, self.writer_tx.send(WriterCommand::Send(frame)))
                .await;
        let failure = match enqueued {
            Ok(Ok(())) => None,
            Ok(Err(_)) => Some(BridgeError::Transport("writer channel closed".to_string())),
            Err(_) => {
                tracing::debug!(id, method, "Writer channel full until deadline");
                Some(BridgeError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        };
        if let Some(err) = failure {
            if let Some(entry) = self.pending.lock().await.requests.remove(&id) {
                entry.timer.abort();
            }
            return Err(err);
        }

        // The deadline task settles `tx` no later than `deadline`.
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::SessionLost {
                method: method.to_string(),
            }),
        }
    }

    /// Fire-and-forget; no pending entry is created. Waits at most the send
    /// timeout for room in the writer channel.
    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> BridgeResult<()> {
        let frame = serde_json::to_value(Notification::new(method, params))
            .map_err(|e| BridgeError::Transport(format!("serializing {method}: {e}")))?;
        match self
            .writer_tx
            .send_timeout(WriterCommand::Send(frame), self.send_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(BridgeError::Timeout {
                method: method.to_string(),
                after: self.send_timeout,
            }),
            Err(SendTimeoutError::Closed(_)) => {
                Err(BridgeError::Transport("writer channel closed".to_string()))
            }
        }
    }

    /// Route one decoded inbound frame.
    pub async fn dispatch(&self, frame: &serde_json::Value) {
        let Some(incoming) = protocol::parse_incoming(frame) else {
            tracing::trace!("Ignoring malformed JSON-RPC frame");
            return;
        };

        match incoming {
            IncomingFrame::Response { id, body } => {
                let entry = self.pending.lock().await.requests.remove(&id);
                let Some(entry) = entry else {
                    tracing::debug!(id, "Response for unknown or expired request");
                    return;
                };
                entry.timer.abort();
                let outcome = match body.get("error") {
                    Some(error) => Err(BridgeError::from_rpc_error(error)),
                    None => Ok(body
                        .get("result")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null)),
                };
                tracing::trace!(
                    id,
                    method = %entry.method,
                    elapsed = ?entry.issued_at.elapsed(),
                    "LSP response"
                );
                // Receiver is gone if the caller stopped waiting.
                let _ = entry.tx.send(outcome);
            }
            IncomingFrame::ServerRequest { id, method, params } => {
                tracing::debug!(%method, "Server request");
                let reply = protocol::server_request_reply(&id, &method, params.as_ref());
                // The reader must keep draining responses, so never wait here.
                if let Err(TrySendError::Full(_)) =
                    self.writer_tx.try_send(WriterCommand::Send(reply))
                {
                    tracing::warn!(%method, "Writer channel full, dropping reply to server request");
                }
            }
            IncomingFrame::Notification { method, params } => {
                if !self.subscriptions.dispatch(&method, params.as_ref()) {
                    tracing::trace!(%method, "Ignoring notification");
                }
            }
        }
    }

    /// Reject every outstanding request and refuse new ones.
    pub async fn fail_all(&self) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().await;
            pending.closed = true;
            pending.requests.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.timer.abort();
            let _ = entry.tx.send(Err(BridgeError::SessionLost {
                method: entry.method,
            }));
        }
        count
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.requests.len()
    }

    /// Ask the writer task to close the server's stdin. Skipped when the
    /// writer is backed up; the process is killed after the grace period anyway.
    pub fn close_writer(&self) {
        let _ = self.writer_tx.try_send(WriterCommand::Shutdown);
    }
}

async fn expire(
    pending: Weak<Mutex<PendingState>>,
    writer_tx: mpsc::Sender<WriterCommand>,
    id: u64,
    deadline: Instant,
) {
    tokio::time::sleep_until(deadline).await;
    let Some(pending) = pending.upgrade() else {
        return;
    };
    let Some(entry) = pending.lock().await.requests.remove(&id) else {
        return;
    };
    let after = deadline.saturating_duration_since(entry.issued_at);
    tracing::debug!(id, method = %entry.method, "LSP request timed out");
    let _ = entry.tx.send(Err(BridgeError::Timeout {
        method: entry.method,
        after,
    }));

    if let Ok(frame) = serde_json::to_value(Notification::new(
        "$/cancelRequest",
        Some(protocol::cancel_params(id)),
    )) {
        let _ = writer_tx.try_send(WriterCommand::Send(frame));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn correlator() -> (Arc<Correlator>, mpsc::Receiver<WriterCommand>) {
        let (writer_tx, writer_rx) = mpsc::channel(32);
        (
            Arc::new(Correlator::new(1, writer_tx, Subscriptions::default())),
            writer_rx,
        )
    }

    async fn next_sent(rx: &mut mpsc::Receiver<WriterCommand>) -> serde_json::Value {
        match rx.recv().await {
            Some(WriterCommand::Send(frame)) => frame,
            Some(WriterCommand::Shutdown) => panic!("unexpected shutdown command"),
            None => panic!("writer channel closed"),
        }
    }

    #[tokio::test]
    async fn test_response_resolves_pending_request() {
        let (rpc, mut writer_rx) = correlator();
        let caller = {
            let rpc = rpc.clone();
            tokio::spawn(async move {
                rpc.request("textDocument/hover", None, Duration::from_secs(5))
                    .await
            })
        };

        let sent = next_sent(&mut writer_rx).await;
        assert_eq!(sent["method"], "textDocument/hover");
        let id = sent["id"].as_u64().unwrap();
        rpc.dispatch(&serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {"ok": true}}))
            .await;

        let result = caller.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(rpc.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_error_response_rejects_with_protocol_error() {
        let (rpc, mut writer_rx) = correlator();
        let caller = {
            let rpc = rpc.clone();
            tokio::spawn(async move { rpc.request("workspace/symbol", None, Duration::from_secs(5)).await })
        };

        let id = next_sent(&mut writer_rx).await["id"].as_u64().unwrap();
        rpc.dispatch(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32800, "message": "cancelled"}
        }))
        .await;

        match caller.await.unwrap() {
            Err(BridgeError::Protocol { code, message }) => {
                assert_eq!(code, -32800);
                assert_eq!(message, "cancelled");
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_at_deadline_and_removes_entry() {
        let (rpc, mut writer_rx) = correlator();
        let timeout = Duration::from_millis(500);
        let started = Instant::now();

        let err = rpc
            .request("textDocument/hover", None, timeout)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, BridgeError::Timeout { .. }), "{err:?}");
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(50));
        assert_eq!(rpc.pending_len().await, 0);

        let request = next_sent(&mut writer_rx).await;
        let cancel = next_sent(&mut writer_rx).await;
        assert_eq!(cancel["method"], "$/cancelRequest");
        assert_eq!(cancel["params"]["id"], request["id"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_is_cleaned_up_by_deadline() {
        let (rpc, _writer_rx) = correlator();
        let caller = {
            let rpc = rpc.clone();
            tokio::spawn(async move { rpc.request("textDocument/hover", None, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rpc.pending_len().await, 1);

        caller.abort();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rpc.pending_len().await, 1, "abandonment does not cancel");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rpc.pending_len().await, 0);
    }

    /// Writer channel with no room left and nobody draining it.
    fn stalled_correlator() -> (Correlator, mpsc::Receiver<WriterCommand>) {
        let (writer_tx, writer_rx) = mpsc::channel(1);
        writer_tx
            .try_send(WriterCommand::Send(serde_json::Value::Null))
            .unwrap();
        let rpc = Correlator::new(1, writer_tx, Subscriptions::default())
            .with_send_timeout(Duration::from_millis(200));
        (rpc, writer_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_when_writer_is_stalled() {
        let (rpc, _writer_rx) = stalled_correlator();
        let timeout = Duration::from_millis(100);
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            rpc.request("textDocument/hover", None, timeout),
        )
        .await
        .expect("request must settle at its own deadline");
        let elapsed = started.elapsed();

        assert!(matches!(outcome, Err(BridgeError::Timeout { .. })), "{outcome:?}");
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(50));
        assert_eq!(rpc.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_and_server_replies_do_not_block_on_stalled_writer() {
        let (rpc, _writer_rx) = stalled_correlator();

        let err = rpc
            .notify("textDocument/didChange", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { after, .. } if after == Duration::from_millis(200)));

        let dispatched = tokio::time::timeout(
            Duration::from_millis(10),
            rpc.dispatch(&serde_json::json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "client/registerCapability",
                "params": {"registrations": []}
            })),
        )
        .await;
        assert!(dispatched.is_ok(), "reader must not wait on the writer");
        rpc.close_writer();
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_increasing() {
        let (rpc, mut writer_rx) = correlator();
        for _ in 0..3 {
            let rpc = rpc.clone();
            tokio::spawn(async move { rpc.request("x", None, Duration::from_secs(5)).await });
        }
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(next_sent(&mut writer_rx).await["id"].as_u64().unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| *id >= 1));
    }

    #[tokio::test]
    async fn test_fail_all_rejects_pending_and_new_requests() {
        let (rpc, mut writer_rx) = correlator();
        let caller = {
            let rpc = rpc.clone();
            tokio::spawn(async move { rpc.request("textDocument/completion", None, Duration::from_secs(30)).await })
        };
        let _ = next_sent(&mut writer_rx).await;

        assert_eq!(rpc.fail_all().await, 1);
        assert!(matches!(
            caller.await.unwrap(),
            Err(BridgeError::SessionLost { .. })
        ));
        assert!(matches!(
            rpc.request("x", None, Duration::from_secs(1)).await,
            Err(BridgeError::SessionLost { .. })
        ));
        assert_eq!(rpc.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_server_request_gets_reply() {
        let (rpc, mut writer_rx) = correlator();
        rpc.dispatch(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "window/workDoneProgress/create",
            "params": {"token": "idx"}
        }))
        .await;
        let reply = next_sent(&mut writer_rx).await;
        assert_eq!(reply["id"], 0);
        assert!(reply["result"].is_null());
    }

    #[tokio::test]
    async fn test_notifications_reach_subscribers_unknown_ignored() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut subs = Subscriptions::default();
        let counter = hits.clone();
        subs.on("$/progress", move |params| {
            assert!(params.is_some());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (writer_tx, _writer_rx) = mpsc::channel(8);
        let rpc = Correlator::new(1, writer_tx, subs);

        rpc.dispatch(&serde_json::json!({"jsonrpc": "2.0", "method": "$/progress", "params": {}}))
            .await;
        rpc.dispatch(&serde_json::json!({"jsonrpc": "2.0", "method": "custom/unknown"}))
            .await;
        // Response nobody is waiting for.
        rpc.dispatch(&serde_json::json!({"jsonrpc": "2.0", "id": 99, "result": null}))
            .await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

//! Typed failures surfaced by the bridge.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::ReadinessState;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The stream to the server broke (write failed, process gone).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{method} timed out after {}ms", after.as_millis())]
    Timeout { method: String, after: Duration },

    /// The server answered with an `error` object.
    #[error("server error {code}: {message}")]
    Protocol { code: i64, message: String },

    /// The server's answer was well-framed but unusable (e.g. overlapping edits).
    #[error("invalid {method} response: {reason}")]
    InvalidResponse { method: String, reason: String },

    #[error("language server not ready ({phase}) after waiting {}ms", waited.as_millis())]
    NotReady {
        phase: ReadinessState,
        waited: Duration,
    },

    #[error("language server failed: restart limit of {attempts} reached")]
    RestartsExhausted { attempts: u32 },

    /// The session ended while the request was in flight; retrying is safe.
    #[error("language server session ended during {method}")]
    SessionLost { method: String },

    #[error("language server not started")]
    NotStarted,

    #[error("invalid path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch language server: {0:#}")]
    Launch(anyhow::Error),
}

impl BridgeError {
    /// Whether retrying the same operation later can succeed without the
    /// owner restarting the bridge.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout { .. } | Self::NotReady { .. } | Self::SessionLost { .. }
        )
    }

    /// Whether the bridge itself is unusable until restarted.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RestartsExhausted { .. } | Self::NotStarted)
    }

    /// Build a protocol error from a JSON-RPC `error` object.
    pub(crate) fn from_rpc_error(error: &serde_json::Value) -> Self {
        Self::Protocol {
            code: error
                .get("code")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or_default(),
            message: error
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

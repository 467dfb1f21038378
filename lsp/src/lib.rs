//! Supervised LSP client that serves tool calls.
//!
//! [`Bridge`] owns one language server process: it frames and correlates
//! JSON-RPC traffic, drives the initialize handshake and indexing progress,
//! keeps open documents in sync with disk, and restarts the server within a
//! budget when it dies.

pub mod codec;
pub mod edits;
pub mod types;

mod bridge;
mod correlator;
mod diagnostics;
mod documents;
mod error;
mod protocol;
mod readiness;
mod results;
mod supervisor;

pub use bridge::Bridge;
pub use edits::{EditError, apply_text_edits};
pub use error::{BridgeError, BridgeResult};
pub use protocol::{PathToUriError, file_uri_to_path, path_to_file_uri};
pub use supervisor::{LaunchedServer, ServerLauncher, StdioLauncher, resolve_command};
pub use types::{
    BridgeConfig, BridgeStatus, CompletionEntry, Diagnostic, DiagnosticSeverity, FileEdits,
    Formatted, FormattingOptions, HoverInfo, Outcome, Position, Range, ReadinessSignal,
    ReadinessState, Reply, ServerConfig, Symbol, SymbolKind, TextEdit,
};

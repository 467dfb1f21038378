//! Public types consumed by the tool layer.
//!
//! These types define the interface between `tether-lsp` and its callers.
//! Callers construct a [`BridgeConfig`], call operations on the bridge, and
//! receive [`Reply`] values that always state the readiness phase the answer
//! was produced in.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default time an operation waits for the server to become usable.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
/// Default grace period between `exit` and a forced kill.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Default wait for pushed diagnostics after a document sync.
pub const DEFAULT_DIAGNOSTICS_SETTLE: Duration = Duration::from_millis(1500);
pub const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 3;

/// Configuration for the bridge core.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Workspace root; the server's working directory and `rootUri`.
    pub project_root: PathBuf,
    pub request_timeout: Duration,
    pub ready_timeout: Duration,
    /// Restarts allowed after unexpected exits before the bridge gives up.
    pub max_restart_attempts: u32,
    /// Serve requests once the handshake completes, before indexing ends.
    pub fast_start: bool,
    pub shutdown_grace: Duration,
    pub diagnostics_settle: Duration,
    pub server: ServerConfig,
}

impl BridgeConfig {
    #[must_use]
    pub fn new(project_root: PathBuf, server: ServerConfig) -> Self {
        Self {
            project_root,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            max_restart_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            fast_start: false,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            diagnostics_settle: DEFAULT_DIAGNOSTICS_SETTLE,
            server,
        }
    }
}

/// How the server announces that workspace indexing finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessSignal {
    /// All work-done progress the server began has ended, or the server
    /// reported itself quiescent.
    #[default]
    Progress,
    /// The server has no indexing phase; the initialize response is enough.
    Handshake,
}

/// Configuration for the language server process.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Executable command (e.g. "clangd").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Directories searched for `command` before `PATH`, relative to the
    /// project root unless absolute.
    #[serde(default)]
    pub install_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub readiness_signal: ReadinessSignal,
    /// File extension → LSP language identifier (e.g. `"hpp" = "cpp"`).
    #[serde(default)]
    pub language_ids: HashMap<String, String>,
}

impl ServerConfig {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            install_dirs: Vec::new(),
            readiness_signal: ReadinessSignal::default(),
            language_ids: HashMap::new(),
        }
    }

    /// Language identifier for a file, falling back to its extension.
    #[must_use]
    pub fn language_id_for(&self, path: &Path) -> String {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        match self.language_ids.get(ext) {
            Some(id) => id.clone(),
            None if ext.is_empty() => "plaintext".to_string(),
            None => ext.to_ascii_lowercase(),
        }
    }
}

/// Phase of language-server startup and indexing.
///
/// `NotStarted → Handshaking → Indexing → Ready`. A crash moves the bridge
/// back to `Handshaking`; a handshake that fails on a restarted process
/// passes through `Degraded` before the next attempt. `Failed` is terminal
/// until the owner restarts the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ReadinessState {
    NotStarted,
    Handshaking,
    Indexing { percent: Option<u8> },
    Ready,
    Degraded,
    Failed,
}

impl ReadinessState {
    /// Whether semantic requests may be served in this phase.
    #[must_use]
    pub fn is_usable(self, fast_start: bool) -> bool {
        match self {
            Self::Ready => true,
            Self::Indexing { .. } => fast_start,
            Self::NotStarted | Self::Handshaking | Self::Degraded | Self::Failed => false,
        }
    }

    #[must_use]
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Handshaking => "handshaking",
            Self::Indexing { .. } => "indexing",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Indexing {
                percent: Some(percent),
            } => write!(f, "indexing ({percent}%)"),
            other => f.write_str(other.label()),
        }
    }
}

/// Zero-based position; `character` counts UTF-16 code units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize, Serialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// Flattened hover text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoverInfo {
    pub contents: String,
    pub range: Option<Range>,
}

/// LSP `SymbolKind` (1-based numeric enum).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolKind(pub u32);

impl SymbolKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        const LABELS: [&str; 26] = [
            "file",
            "module",
            "namespace",
            "package",
            "class",
            "method",
            "property",
            "field",
            "constructor",
            "enum",
            "interface",
            "function",
            "variable",
            "constant",
            "string",
            "number",
            "boolean",
            "array",
            "object",
            "key",
            "null",
            "enum member",
            "struct",
            "event",
            "operator",
            "type parameter",
        ];
        self.0
            .checked_sub(1)
            .and_then(|i| LABELS.get(i as usize))
            .copied()
            .unwrap_or("symbol")
    }
}

/// A symbol from a document outline or a workspace search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub detail: Option<String>,
    pub container: Option<String>,
    /// File the symbol lives in; `None` for document outlines (the queried file).
    pub path: Option<PathBuf>,
    pub range: Range,
    /// Nesting depth in a hierarchical outline (0 = top level).
    pub depth: usize,
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A single diagnostic from the language server.
///
/// Fields are private; construction goes through [`Diagnostic::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    message: String,
    /// 0-indexed line number.
    line: u32,
    /// 0-indexed column.
    col: u32,
    /// Source of the diagnostic (e.g. "clang", "clang-tidy").
    source: String,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        message: String,
        line: u32,
        col: u32,
        source: String,
    ) -> Self {
        Self {
            severity,
            message,
            line,
            col,
            source,
        }
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 0-indexed line number.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// 0-indexed column.
    #[must_use]
    pub fn col(&self) -> u32 {
        self.col
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Format as `path:line:col: severity: [source] message` (1-indexed for display).
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            path.display(),
            self.line + 1,
            self.col + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEntry {
    pub label: String,
    /// LSP `CompletionItemKind` number, if the server sent one.
    pub kind: Option<u32>,
    pub detail: Option<String>,
    pub insert_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TextEdit {
    pub range: Range,
    #[serde(rename = "newText")]
    pub new_text: String,
}

/// Edits targeting one file, as returned by rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEdits {
    pub path: PathBuf,
    pub edits: Vec<TextEdit>,
}

/// Result of a formatting request: the edits plus the text they produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formatted {
    pub edits: Vec<TextEdit>,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormattingOptions {
    pub tab_size: u32,
    pub insert_spaces: bool,
}

impl Default for FormattingOptions {
    fn default() -> Self {
        Self {
            tab_size: 4,
            insert_spaces: true,
        }
    }
}

/// Whether an operation found anything. "Nothing" is an answer, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Found(T),
    Empty,
}

/// An answer from the bridge, tagged with the readiness phase it was
/// produced in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply<T> {
    outcome: Outcome<T>,
    phase: ReadinessState,
}

impl<T> Reply<T> {
    pub(crate) fn new(outcome: Outcome<T>, phase: ReadinessState) -> Self {
        Self { outcome, phase }
    }

    pub(crate) fn empty(phase: ReadinessState) -> Self {
        Self::new(Outcome::Empty, phase)
    }

    #[must_use]
    pub fn outcome(&self) -> &Outcome<T> {
        &self.outcome
    }

    #[must_use]
    pub fn into_outcome(self) -> Outcome<T> {
        self.outcome
    }

    /// The found value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&T> {
        match &self.outcome {
            Outcome::Found(value) => Some(value),
            Outcome::Empty => None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self.outcome, Outcome::Empty)
    }

    #[must_use]
    pub fn phase(&self) -> ReadinessState {
        self.phase
    }

    /// True when the answer was produced before indexing finished and may be
    /// incomplete.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.phase.is_ready()
    }
}

/// Point-in-time view of the bridge for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub phase: ReadinessState,
    /// Restarts performed since the bridge was (re)started by its owner.
    pub restarts: u32,
    pub max_restart_attempts: u32,
    /// Process generation, 0 before the first launch.
    pub generation: u64,
    pub open_documents: usize,
    pub pending_requests: usize,
    pub indexing_message: Option<String>,
    pub server_name: Option<String>,
    pub fast_start: bool,
}

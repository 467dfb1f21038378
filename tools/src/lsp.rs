//! The LSP tool set.
//!
//! Tool arguments use 1-based `line`/`column`; the bridge works 0-based.
//! Relative `file` arguments resolve against the project root.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Value, json};
use tether_lsp::{Bridge, BridgeError, FormattingOptions, Outcome, Position, Reply};

use crate::{ToolDefinition, ToolError, parse_args, render};

/// One variant per tool; all share the `(arguments, bridge) -> text` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LspTool {
    Hover,
    DocumentSymbols,
    WorkspaceSymbols,
    Diagnostics,
    Completion,
    Format,
    Rename,
    CloseDocument,
    Status,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileArgs {
    file: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PositionArgs {
    file: String,
    line: u32,
    column: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueryArgs {
    query: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FormatArgs {
    file: String,
    tab_size: Option<u32>,
    insert_spaces: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RenameArgs {
    file: String,
    line: u32,
    column: u32,
    new_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

fn zero_based(line: u32, column: u32) -> Result<Position, ToolError> {
    if line == 0 || column == 0 {
        return Err(ToolError::BadArgs {
            message: format!("line and column are 1-based, got {line}:{column}"),
        });
    }
    Ok(Position::new(line - 1, column - 1))
}

fn require_file(file: &str) -> Result<&Path, ToolError> {
    if file.trim().is_empty() {
        return Err(ToolError::BadArgs {
            message: "file must not be empty".to_string(),
        });
    }
    Ok(Path::new(file))
}

fn file_schema() -> Value {
    json!({
        "type": "string",
        "description": "Path to the source file, absolute or relative to the project root"
    })
}

fn position_properties() -> serde_json::Map<String, Value> {
    let mut props = serde_json::Map::new();
    props.insert("file".into(), file_schema());
    props.insert(
        "line".into(),
        json!({"type": "integer", "minimum": 1, "description": "1-based line number"}),
    );
    props.insert(
        "column".into(),
        json!({"type": "integer", "minimum": 1, "description": "1-based column (UTF-16 code units)"}),
    );
    props
}

/// Render an outcome, falling back to `empty` when there was nothing to show.
fn outcome_text<T>(
    reply: Reply<T>,
    empty: impl FnOnce() -> String,
    found: impl FnOnce(&T) -> String,
) -> String {
    let phase = reply.phase();
    let partial = reply.is_partial();
    let text = match reply.outcome() {
        Outcome::Found(value) => found(value),
        Outcome::Empty => empty(),
    };
    render::with_phase_note(text, partial, phase)
}

impl LspTool {
    pub const ALL: [LspTool; 9] = [
        Self::Hover,
        Self::DocumentSymbols,
        Self::WorkspaceSymbols,
        Self::Diagnostics,
        Self::Completion,
        Self::Format,
        Self::Rename,
        Self::CloseDocument,
        Self::Status,
    ];

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Hover => "lsp_hover",
            Self::DocumentSymbols => "lsp_document_symbols",
            Self::WorkspaceSymbols => "lsp_workspace_symbols",
            Self::Diagnostics => "lsp_diagnostics",
            Self::Completion => "lsp_completion",
            Self::Format => "lsp_format",
            Self::Rename => "lsp_rename",
            Self::CloseDocument => "lsp_close_document",
            Self::Status => "lsp_status",
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Hover => "Show type and documentation for the symbol at a position.",
            Self::DocumentSymbols => "List the symbols declared in a file as an outline.",
            Self::WorkspaceSymbols => {
                "Search symbols by name across the project. An empty query returns nothing; \
                 results may be incomplete while the server is still indexing."
            }
            Self::Diagnostics => "Report compiler diagnostics for a file's current content.",
            Self::Completion => "List completion candidates at a position.",
            Self::Format => {
                "Compute formatting edits for a file and return the formatted text. \
                 The file is not modified."
            }
            Self::Rename => {
                "Compute the edits needed to rename the symbol at a position. \
                 No files are modified."
            }
            Self::CloseDocument => "Tell the language server to stop tracking a file.",
            Self::Status => "Report language server readiness, restarts and open documents.",
        }
    }

    #[must_use]
    pub fn schema(self) -> Value {
        match self {
            Self::Hover | Self::Completion => json!({
                "type": "object",
                "properties": position_properties(),
                "required": ["file", "line", "column"],
                "additionalProperties": false
            }),
            Self::DocumentSymbols | Self::Diagnostics | Self::CloseDocument => json!({
                "type": "object",
                "properties": { "file": file_schema() },
                "required": ["file"],
                "additionalProperties": false
            }),
            Self::WorkspaceSymbols => json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Symbol name or fragment"}
                },
                "required": ["query"],
                "additionalProperties": false
            }),
            Self::Format => json!({
                "type": "object",
                "properties": {
                    "file": file_schema(),
                    "tab_size": {"type": "integer", "minimum": 1, "description": "Spaces per tab (default 4)"},
                    "insert_spaces": {"type": "boolean", "description": "Indent with spaces (default true)"}
                },
                "required": ["file"],
                "additionalProperties": false
            }),
            Self::Rename => {
                let mut props = position_properties();
                props.insert(
                    "new_name".into(),
                    json!({"type": "string", "description": "Replacement identifier"}),
                );
                json!({
                    "type": "object",
                    "properties": props,
                    "required": ["file", "line", "column", "new_name"],
                    "additionalProperties": false
                })
            }
            Self::Status => json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        }
    }

    #[must_use]
    pub fn definition(self) -> ToolDefinition {
        ToolDefinition {
            name: self.name(),
            description: self.description(),
            input_schema: self.schema(),
        }
    }

    pub async fn call(self, args: &Value, bridge: &Bridge) -> Result<String, ToolError> {
        let root = bridge.project_root().to_path_buf();
        let fail = |context: String| {
            let tool = self.name();
            move |source: BridgeError| ToolError::Bridge {
                tool,
                context,
                source,
            }
        };

        match self {
            Self::Hover => {
                let args: PositionArgs = parse_args(args)?;
                let file = require_file(&args.file)?;
                let position = zero_based(args.line, args.column)?;
                let here = render::location(file, &root, args.line, args.column);
                let reply = bridge
                    .hover(file, position)
                    .await
                    .map_err(fail(here.clone()))?;
                Ok(outcome_text(
                    reply,
                    || format!("No hover information at {here}."),
                    render::hover,
                ))
            }
            Self::DocumentSymbols => {
                let args: FileArgs = parse_args(args)?;
                let file = require_file(&args.file)?;
                let shown = render::display_path(file, &root);
                let reply = bridge
                    .document_symbols(file)
                    .await
                    .map_err(fail(shown.clone()))?;
                Ok(outcome_text(
                    reply,
                    || format!("No symbols in {shown}."),
                    |symbols| render::document_symbols(symbols),
                ))
            }
            Self::WorkspaceSymbols => {
                let args: QueryArgs = parse_args(args)?;
                let reply = bridge
                    .workspace_symbols(&args.query)
                    .await
                    .map_err(fail(format!("query {:?}", args.query)))?;
                Ok(outcome_text(
                    reply,
                    || format!("No symbols match {:?}.", args.query),
                    |symbols| render::workspace_symbols(symbols, &root),
                ))
            }
            Self::Diagnostics => {
                let args: FileArgs = parse_args(args)?;
                let file = require_file(&args.file)?;
                let shown = render::display_path(file, &root);
                let reply = bridge
                    .diagnostics(file)
                    .await
                    .map_err(fail(shown.clone()))?;
                let path = resolved(file, &root);
                Ok(outcome_text(
                    reply,
                    || format!("No diagnostics for {shown}."),
                    |items| render::diagnostics(items, &path, &root),
                ))
            }
            Self::Completion => {
                let args: PositionArgs = parse_args(args)?;
                let file = require_file(&args.file)?;
                let position = zero_based(args.line, args.column)?;
                let here = render::location(file, &root, args.line, args.column);
                let reply = bridge
                    .completion(file, position)
                    .await
                    .map_err(fail(here.clone()))?;
                Ok(outcome_text(
                    reply,
                    || format!("No completions at {here}."),
                    |entries| render::completion(entries),
                ))
            }
            Self::Format => {
                let args: FormatArgs = parse_args(args)?;
                let file = require_file(&args.file)?;
                let defaults = FormattingOptions::default();
                let options = FormattingOptions {
                    tab_size: args.tab_size.unwrap_or(defaults.tab_size),
                    insert_spaces: args.insert_spaces.unwrap_or(defaults.insert_spaces),
                };
                if options.tab_size == 0 {
                    return Err(ToolError::BadArgs {
                        message: "tab_size must be at least 1".to_string(),
                    });
                }
                let shown = render::display_path(file, &root);
                let reply = bridge
                    .formatting(file, options)
                    .await
                    .map_err(fail(shown.clone()))?;
                let path = resolved(file, &root);
                Ok(outcome_text(
                    reply,
                    || format!("{shown} is already formatted."),
                    |result| render::formatted(result, &path, &root),
                ))
            }
            Self::Rename => {
                let args: RenameArgs = parse_args(args)?;
                let file = require_file(&args.file)?;
                let position = zero_based(args.line, args.column)?;
                let here = render::location(file, &root, args.line, args.column);
                let reply = bridge
                    .rename(file, position, &args.new_name)
                    .await
                    .map_err(fail(here.clone()))?;
                Ok(outcome_text(
                    reply,
                    || format!("Nothing to rename at {here}."),
                    |changes| render::rename(changes, &root),
                ))
            }
            Self::CloseDocument => {
                let args: FileArgs = parse_args(args)?;
                let file = require_file(&args.file)?;
                let shown = render::display_path(file, &root);
                let closed = bridge
                    .close_document(file)
                    .await
                    .map_err(fail(shown.clone()))?;
                Ok(if closed {
                    format!("Closed {shown}.")
                } else {
                    format!("{shown} was not open.")
                })
            }
            Self::Status => {
                let _: NoArgs = parse_args(args)?;
                Ok(render::status(&bridge.status().await))
            }
        }
    }
}

fn resolved(file: &Path, root: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        root.join(file)
    }
}

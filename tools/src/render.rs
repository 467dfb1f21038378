//! Plain-text rendering of bridge replies.
//!
//! Positions are shown 1-based, paths relative to the project root.

use std::path::{Path, PathBuf};

use tether_lsp::{
    BridgeStatus, CompletionEntry, Diagnostic, FileEdits, Formatted, HoverInfo, Range,
    ReadinessState, Symbol,
};

/// Root-relative display form of `path`, or the path itself when outside the root.
pub(crate) fn display_path(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}

pub(crate) fn location(path: &Path, root: &Path, line: u32, column: u32) -> String {
    format!("{}:{line}:{column}", display_path(path, root))
}

fn range(range: &Range) -> String {
    format!(
        "{}:{}-{}:{}",
        range.start.line + 1,
        range.start.character + 1,
        range.end.line + 1,
        range.end.character + 1
    )
}

/// Appends a notice when the answer was produced before indexing finished.
pub(crate) fn with_phase_note(mut text: String, partial: bool, phase: ReadinessState) -> String {
    if partial {
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(&format!(
            "Note: language server is {phase}; results may be incomplete."
        ));
    }
    text
}

pub(crate) fn hover(info: &HoverInfo) -> String {
    match &info.range {
        Some(r) => format!("{}\n\n(range {})", info.contents, range(r)),
        None => info.contents.clone(),
    }
}

pub(crate) fn document_symbols(symbols: &[Symbol]) -> String {
    let mut out = String::new();
    for symbol in symbols {
        out.push_str(&"  ".repeat(symbol.depth));
        out.push_str(&format!(
            "{} {} (line {})",
            symbol.kind.label(),
            symbol.name,
            symbol.range.start.line + 1
        ));
        if let Some(detail) = symbol.detail.as_deref().filter(|d| !d.is_empty()) {
            out.push_str(&format!(" - {detail}"));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

pub(crate) fn workspace_symbols(symbols: &[Symbol], root: &Path) -> String {
    let mut out = format!("{} symbol(s):\n", symbols.len());
    for symbol in symbols {
        let place = symbol.path.as_deref().map_or_else(
            || format!("line {}", symbol.range.start.line + 1),
            |path| {
                location(
                    path,
                    root,
                    symbol.range.start.line + 1,
                    symbol.range.start.character + 1,
                )
            },
        );
        out.push_str(&format!("{} {} - {place}", symbol.kind.label(), symbol.name));
        if let Some(container) = symbol.container.as_deref().filter(|c| !c.is_empty()) {
            out.push_str(&format!(" (in {container})"));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

pub(crate) fn diagnostics(items: &[Diagnostic], path: &Path, root: &Path) -> String {
    let shown = PathBuf::from(display_path(path, root));
    let errors = items.iter().filter(|d| d.severity().is_error()).count();
    let mut out = format!(
        "{} diagnostic(s) in {} ({errors} error(s)):\n",
        items.len(),
        shown.display()
    );
    for item in items {
        out.push_str(&item.display_with_path(&shown));
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn completion_kind(kind: u32) -> Option<&'static str> {
    const LABELS: [&str; 25] = [
        "text",
        "method",
        "function",
        "constructor",
        "field",
        "variable",
        "class",
        "interface",
        "module",
        "property",
        "unit",
        "value",
        "enum",
        "keyword",
        "snippet",
        "color",
        "file",
        "reference",
        "folder",
        "enum member",
        "constant",
        "struct",
        "event",
        "operator",
        "type parameter",
    ];
    let index = kind.checked_sub(1)? as usize;
    LABELS.get(index).copied()
}

pub(crate) fn completion(entries: &[CompletionEntry]) -> String {
    let mut out = format!("{} completion(s):\n", entries.len());
    for entry in entries {
        out.push_str(&entry.label);
        if let Some(kind) = entry.kind.and_then(completion_kind) {
            out.push_str(&format!(" [{kind}]"));
        }
        if let Some(detail) = entry.detail.as_deref().filter(|d| !d.is_empty()) {
            out.push_str(&format!(" - {detail}"));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

pub(crate) fn formatted(result: &Formatted, path: &Path, root: &Path) -> String {
    format!(
        "{} formatting edit(s) for {} (file not written). Formatted text:\n{}",
        result.edits.len(),
        display_path(path, root),
        result.text
    )
}

pub(crate) fn rename(changes: &[FileEdits], root: &Path) -> String {
    let total: usize = changes.iter().map(|c| c.edits.len()).sum();
    let mut out = format!(
        "{total} edit(s) across {} file(s) (files not written):\n",
        changes.len()
    );
    for change in changes {
        out.push_str(&format!("{}:\n", display_path(&change.path, root)));
        for edit in &change.edits {
            out.push_str(&format!("  {} -> {:?}\n", range(&edit.range), edit.new_text));
        }
    }
    out.trim_end().to_string()
}

pub(crate) fn status(status: &BridgeStatus) -> String {
    let mut out = format!("phase: {}\n", status.phase);
    if let Some(message) = &status.indexing_message {
        out.push_str(&format!("indexing: {message}\n"));
    }
    if let Some(name) = &status.server_name {
        out.push_str(&format!("server: {name}\n"));
    }
    out.push_str(&format!(
        "restarts: {}/{}\ngeneration: {}\nopen documents: {}\npending requests: {}\nfast start: {}",
        status.restarts,
        status.max_restart_attempts,
        status.generation,
        status.open_documents,
        status.pending_requests,
        status.fast_start
    ));
    out
}

//! Normalization of LSP result shapes into the bridge's public types.
//!
//! Servers are free to answer most requests in several shapes (hover's
//! `MarkedString | MarkedString[] | MarkupContent`, symbols as
//! `DocumentSymbol[]` or `SymbolInformation[]`, ...). Everything here is
//! lenient: entries that don't parse are skipped rather than failing the
//! whole answer.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

use crate::protocol;
use crate::types::{
    CompletionEntry, FileEdits, HoverInfo, Range, Symbol, SymbolKind, TextEdit,
};

fn parse_range(value: Option<&Value>) -> Option<Range> {
    value.and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

fn marked_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => {
            let text = obj.get("value").and_then(Value::as_str)?;
            // MarkupContent has `kind`; MarkedString has `language`.
            match obj.get("language").and_then(Value::as_str) {
                Some(lang) if obj.get("kind").is_none() => {
                    Some(format!("```{lang}\n{text}\n```"))
                }
                _ => Some(text.to_string()),
            }
        }
        _ => None,
    }
}

/// `null`, or contents that are only whitespace, mean nothing to show.
pub(crate) fn hover(result: &Value) -> Option<HoverInfo> {
    let contents = result.get("contents")?;
    let text = match contents {
        Value::Array(parts) => parts
            .iter()
            .filter_map(marked_string)
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        other => marked_string(other)?,
    };
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(HoverInfo {
        contents: text.to_string(),
        range: parse_range(result.get("range")),
    })
}

fn symbol_information(item: &Value) -> Option<Symbol> {
    let location = item.get("location")?;
    Some(Symbol {
        name: str_field(item, "name")?,
        kind: SymbolKind(
            item.get("kind")
                .and_then(Value::as_u64)
                .and_then(|k| u32::try_from(k).ok())
                .unwrap_or_default(),
        ),
        detail: None,
        container: str_field(item, "containerName").filter(|c| !c.is_empty()),
        path: location
            .get("uri")
            .and_then(Value::as_str)
            .and_then(protocol::file_uri_to_path),
        // WorkspaceSymbol may carry a location without a range.
        range: parse_range(location.get("range")).unwrap_or_default(),
        depth: 0,
    })
}

fn document_symbol(item: &Value, container: Option<&str>, depth: usize, out: &mut Vec<Symbol>) {
    let Some(name) = str_field(item, "name") else {
        return;
    };
    out.push(Symbol {
        name: name.clone(),
        kind: SymbolKind(
            item.get("kind")
                .and_then(Value::as_u64)
                .and_then(|k| u32::try_from(k).ok())
                .unwrap_or_default(),
        ),
        detail: str_field(item, "detail").filter(|d| !d.is_empty()),
        container: container.map(String::from),
        path: None,
        range: parse_range(item.get("selectionRange").or_else(|| item.get("range")))
            .unwrap_or_default(),
        depth,
    });
    if let Some(children) = item.get("children").and_then(Value::as_array) {
        for child in children {
            document_symbol(child, Some(&name), depth + 1, out);
        }
    }
}

/// `DocumentSymbol[]` (flattened depth-first) or `SymbolInformation[]`.
pub(crate) fn document_symbols(result: &Value) -> Vec<Symbol> {
    let Some(items) = result.as_array() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for item in items {
        if item.get("location").is_some() {
            out.extend(symbol_information(item));
        } else {
            document_symbol(item, None, 0, &mut out);
        }
    }
    out
}

pub(crate) fn workspace_symbols(result: &Value) -> Vec<Symbol> {
    result
        .as_array()
        .map(|items| items.iter().filter_map(symbol_information).collect())
        .unwrap_or_default()
}

/// `CompletionItem[]` or `CompletionList`.
pub(crate) fn completion(result: &Value) -> Vec<CompletionEntry> {
    let items = match result {
        Value::Array(items) => items,
        Value::Object(list) => match list.get("items").and_then(Value::as_array) {
            Some(items) => items,
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| {
            Some(CompletionEntry {
                label: str_field(item, "label")?,
                kind: item
                    .get("kind")
                    .and_then(Value::as_u64)
                    .and_then(|k| u32::try_from(k).ok()),
                detail: str_field(item, "detail"),
                insert_text: str_field(item, "insertText")
                    .or_else(|| item.get("textEdit").and_then(|e| str_field(e, "newText"))),
            })
        })
        .collect()
}

pub(crate) fn text_edits(result: &Value) -> Vec<TextEdit> {
    result
        .as_array()
        .map(|edits| {
            edits
                .iter()
                .filter_map(|e| serde_json::from_value(e.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Flatten a `WorkspaceEdit` into per-file edit lists, sorted by path.
///
/// Resource operations (create/rename/delete) in `documentChanges` are
/// skipped; the bridge never touches the filesystem.
pub(crate) fn workspace_edit(result: &Value) -> Vec<FileEdits> {
    let mut by_path: BTreeMap<PathBuf, Vec<TextEdit>> = BTreeMap::new();

    if let Some(changes) = result.get("changes").and_then(Value::as_object) {
        for (uri, edits) in changes {
            if let Some(path) = protocol::file_uri_to_path(uri) {
                by_path.entry(path).or_default().extend(text_edits(edits));
            }
        }
    }

    if let Some(document_changes) = result.get("documentChanges").and_then(Value::as_array) {
        for change in document_changes {
            if change.get("kind").is_some() {
                tracing::debug!("Skipping resource operation in workspace edit");
                continue;
            }
            let Some(path) = change
                .get("textDocument")
                .and_then(|doc| doc.get("uri"))
                .and_then(Value::as_str)
                .and_then(protocol::file_uri_to_path)
            else {
                continue;
            };
            if let Some(edits) = change.get("edits") {
                by_path.entry(path).or_default().extend(text_edits(edits));
            }
        }
    }

    by_path
        .into_iter()
        .filter(|(_, edits)| !edits.is_empty())
        .map(|(path, edits)| FileEdits { path, edits })
        .collect()
}

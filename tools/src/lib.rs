//! Tool registry - maps tool calls from the host onto [`Bridge`] operations.
//!
//! Every tool shares one contract: JSON arguments in, rendered text out.
//! Failures that the caller should read (server errors, timeouts, readiness)
//! come back as [`ToolError`] values carrying the file/position context of the
//! call; the host turns them into error results rather than protocol errors.

mod lsp;
mod render;

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tether_lsp::{Bridge, BridgeError};

pub use lsp::LspTool;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Bad tool args: {message}")]
    BadArgs { message: String },
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },
    #[error("Duplicate tool registered: {name}")]
    DuplicateTool { name: String },
    /// The bridge rejected or failed the operation.
    #[error("{tool} failed for {context}: {source}")]
    Bridge {
        tool: &'static str,
        context: String,
        #[source]
        source: BridgeError,
    },
}

impl ToolError {
    /// Whether calling the same tool again later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Bridge { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// Text shown to the caller, with a hint when the failure is transient.
    #[must_use]
    pub fn user_message(&self) -> String {
        if self.is_retryable() {
            format!("{self} (temporary; retrying may succeed)")
        } else {
            self.to_string()
        }
    }
}

/// Tool description advertised to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, ToolError> {
    // Hosts may send `null` or omit arguments for tools that take none.
    let args = if args.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        args.clone()
    };
    serde_json::from_value(args).map_err(|e| ToolError::BadArgs {
        message: e.to_string(),
    })
}

/// Name to handler map.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, LspTool>,
}

impl ToolRegistry {
    /// Registry holding every LSP tool.
    #[must_use]
    pub fn with_lsp_tools() -> Self {
        let mut registry = Self::default();
        for tool in LspTool::ALL {
            if let Err(e) = registry.register(tool) {
                tracing::warn!("Skipping tool: {e}");
            }
        }
        registry
    }

    pub fn register(&mut self, tool: LspTool) -> Result<(), ToolError> {
        let name = tool.name();
        if self.tools.contains_key(name) {
            return Err(ToolError::DuplicateTool {
                name: name.to_string(),
            });
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<LspTool> {
        self.tools.get(name).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions sorted by name.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }

    pub async fn call(&self, name: &str, args: &Value, bridge: &Bridge) -> Result<String, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::UnknownTool {
            name: name.to_string(),
        })?;
        tracing::debug!(tool = name, "tool call");
        let result = tool.call(args, bridge).await;
        if let Err(e) = &result {
            tracing::info!(tool = name, error = %e, "tool call failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_lists_every_tool_sorted() {
        let registry = ToolRegistry::with_lsp_tools();
        assert_eq!(registry.len(), LspTool::ALL.len());
        let names: Vec<_> = registry.definitions().iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "lsp_close_document",
                "lsp_completion",
                "lsp_diagnostics",
                "lsp_document_symbols",
                "lsp_format",
                "lsp_hover",
                "lsp_rename",
                "lsp_status",
                "lsp_workspace_symbols",
            ]
        );
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = ToolRegistry::default();
        registry.register(LspTool::Hover).unwrap();
        let err = registry.register(LspTool::Hover).unwrap_err();
        assert!(matches!(err, ToolError::DuplicateTool { name } if name == "lsp_hover"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_definition_serializes_input_schema_key() {
        let def = LspTool::Status.definition();
        let value = serde_json::to_value(def).unwrap();
        assert_eq!(value["name"], "lsp_status");
        assert_eq!(value["inputSchema"]["type"], "object");
    }

    #[test]
    fn test_parse_args_treats_null_as_empty_object() {
        #[derive(serde::Deserialize)]
        struct NoArgs {}
        assert!(parse_args::<NoArgs>(&Value::Null).is_ok());
        let err = parse_args::<NoArgs>(&json!("nope")).err().unwrap();
        assert!(matches!(err, ToolError::BadArgs { .. }));
    }

    #[test]
    fn test_retry_hint_only_for_recoverable_failures() {
        let timeout = ToolError::Bridge {
            tool: "lsp_hover",
            context: "a.cpp:1:1".to_string(),
            source: BridgeError::Timeout {
                method: "textDocument/hover".to_string(),
                after: std::time::Duration::from_millis(10),
            },
        };
        assert!(timeout.user_message().contains("retrying may succeed"));

        let server = ToolError::Bridge {
            tool: "lsp_rename",
            context: "a.cpp:2:3".to_string(),
            source: BridgeError::Protocol {
                code: -32602,
                message: "invalid name".to_string(),
            },
        };
        assert!(!server.is_retryable());
        assert_eq!(
            server.user_message(),
            "lsp_rename failed for a.cpp:2:3: server error -32602: invalid name"
        );
    }
}

//! Tool registry: the set of tools a session may dispatch to.
//!
//! Provides:
//! - Tool lookup by name
//! - Structural validation of call arguments against the declared schema
//! - Serialization of tool definitions for the completion request

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Tool, ToolSpec};
use crate::agent_core::errors::DispatchError;

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Registered tools keyed by name.
///
/// A `BTreeMap` keeps `definitions()` in a stable order so identical
/// transcripts produce identical requests.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.spec().name.clone();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "replaced previously registered tool");
        }
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name).map(|t| t.spec())
    }

    /// Return all registered tool names.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(|k| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// OpenAI-format definitions for every registered tool.
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        self.tools.values().map(|t| t.spec().to_openai_definition()).collect()
    }

    /// Validate a tool call: tool exists and arguments match schema.
    ///
    /// A structural check only: arguments must be an object, required fields
    /// present, and top-level fields declared with a `type` must match it.
    pub fn validate_call(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<&Arc<dyn Tool>, DispatchError> {
        let tool = self.get(tool_name).ok_or_else(|| DispatchError::UnknownTool {
            name: tool_name.to_string(),
        })?;
        let schema = &tool.spec().params_schema;

        let invalid = |reason: String| DispatchError::InvalidArguments {
            tool_name: tool_name.to_string(),
            reason,
        };

        let args_obj = arguments
            .as_object()
            .ok_or_else(|| invalid(format!("arguments must be an object, got {}", json_type(arguments))))?;

        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for field in required.iter().filter_map(|f| f.as_str()) {
                if !args_obj.contains_key(field) {
                    return Err(invalid(format!("missing required field: '{field}'")));
                }
            }
        }

        if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
            for (key, value) in args_obj {
                let Some(expected) = props
                    .get(key)
                    .and_then(|p| p.get("type"))
                    .and_then(|t| t.as_str())
                else {
                    continue;
                };
                if !type_matches(expected, value) {
                    return Err(invalid(format!(
                        "field '{key}' should be {expected}, got {}",
                        json_type(value)
                    )));
                }
            }
        }

        Ok(tool)
    }
}

fn type_matches(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

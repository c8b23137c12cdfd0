//! Tools: the capabilities the model can invoke.
//!
//! A tool is any type implementing [`Tool`]. Its [`ToolSpec`] declares the
//! name, JSON schema, effect class and which arguments name filesystem paths
//! or shell commands, so the permission gate can reason about a call without
//! knowing the tool's internals.

pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use registry::ToolRegistry;

// ─── Effect Classes ─────────────────────────────────────────────────────────

/// What a tool does to the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectClass {
    /// Reads files or state; no side effects.
    Read,
    /// Creates, modifies or deletes files.
    Write,
    /// Runs a shell command.
    Exec,
    /// Talks to the network.
    Network,
}

impl EffectClass {
    /// Write and exec tools can change the local machine.
    pub fn is_mutating(&self) -> bool {
        matches!(self, EffectClass::Write | EffectClass::Exec)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EffectClass::Read => "read",
            EffectClass::Write => "write",
            EffectClass::Exec => "exec",
            EffectClass::Network => "network",
        }
    }
}

// ─── Tool Spec ──────────────────────────────────────────────────────────────

/// Static description of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the argument object.
    #[serde(default)]
    pub params_schema: serde_json::Value,
    pub effect: EffectClass,
    /// Argument keys whose values are filesystem paths.
    #[serde(default)]
    pub path_args: Vec<String>,
    /// Argument key holding a shell command line (exec tools).
    #[serde(default)]
    pub command_arg: Option<String>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, effect: EffectClass) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params_schema: serde_json::json!({ "type": "object", "properties": {} }),
            effect,
            path_args: Vec::new(),
            command_arg: None,
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.params_schema = schema;
        self
    }

    pub fn with_path_arg(mut self, key: impl Into<String>) -> Self {
        self.path_args.push(key.into());
        self
    }

    pub fn with_command_arg(mut self, key: impl Into<String>) -> Self {
        self.command_arg = Some(key.into());
        self
    }

    /// Path values present in `arguments`, in declaration order.
    pub fn paths<'a>(&self, arguments: &'a serde_json::Value) -> Vec<&'a str> {
        self.path_args
            .iter()
            .filter_map(|key| arguments.get(key).and_then(|v| v.as_str()))
            .collect()
    }

    /// The command line in `arguments`, if this is a command-bearing tool.
    pub fn command<'a>(&self, arguments: &'a serde_json::Value) -> Option<&'a str> {
        self.command_arg
            .as_deref()
            .and_then(|key| arguments.get(key))
            .and_then(|v| v.as_str())
    }

    /// OpenAI function-calling definition for this tool.
    pub fn to_openai_definition(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.params_schema,
            }
        })
    }
}

// ─── Tool Output ────────────────────────────────────────────────────────────

/// What a tool hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOutput {
    Text(String),
    /// Binary payload (images, archives), base64 encoded.
    Blob {
        mime_type: String,
        data_base64: String,
        caption: Option<String>,
    },
}

impl ToolOutput {
    /// Text the model sees. Blobs are described, not inlined.
    pub fn model_text(&self) -> String {
        match self {
            ToolOutput::Text(text) => text.clone(),
            ToolOutput::Blob {
                mime_type,
                data_base64,
                caption,
            } => {
                let mut s = format!("[binary {mime_type}, {} base64 bytes]", data_base64.len());
                if let Some(caption) = caption {
                    s.push(' ');
                    s.push_str(caption);
                }
                s
            }
        }
    }
}

// ─── Tool Trait ─────────────────────────────────────────────────────────────

/// A capability exposed to the model.
///
/// `execute` may fail or even panic; the dispatcher converts both into a
/// failed tool result and keeps the session alive.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    async fn execute(&self, arguments: serde_json::Value) -> anyhow::Result<ToolOutput>;
}

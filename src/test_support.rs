//! Test-only helpers: scripted providers, fake tools and session builders.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::agent_core::confirmation::{AutoApprove, ConfirmationChannel};
use crate::agent_core::conversation::{ConversationSession, SessionServices};
use crate::agent_core::permissions::PermissionStore;
use crate::agent_core::resources::RuntimeContext;
use crate::agent_core::types::{ToolCallRequest, ToolResult};
use crate::config::RuntimeConfig;
use crate::inference::{CompletionProvider, CompletionRequest, ModelResponse, ProviderError, TokenUsage};
use crate::tools::{EffectClass, Tool, ToolOutput, ToolRegistry, ToolSpec};

// ─── Transcript Fixtures ────────────────────────────────────────────────────

/// A call with empty arguments.
pub fn call(id: &str, name: &str) -> ToolCallRequest {
    call_with(id, name, json!({}))
}

pub fn call_with(id: &str, name: &str, arguments: serde_json::Value) -> ToolCallRequest {
    ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

/// A successful text result answering `call_id`.
pub fn ok_result(call_id: &str, tool_name: &str, text: &str) -> ToolResult {
    ToolResult {
        call_id: call_id.to_string(),
        tool_name: tool_name.to_string(),
        output: ToolOutput::Text(text.to_string()),
        success: true,
        duration_ms: 1,
    }
}

// ─── Model Responses ────────────────────────────────────────────────────────

pub fn text_response(text: &str) -> ModelResponse {
    ModelResponse {
        text: Some(text.to_string()),
        tool_calls: Vec::new(),
        usage: Some(TokenUsage {
            input_tokens: 100,
            output_tokens: 10,
            cost_usd: 0.001,
        }),
    }
}

pub fn tool_call_response(calls: Vec<ToolCallRequest>) -> ModelResponse {
    ModelResponse {
        text: None,
        tool_calls: calls,
        usage: Some(TokenUsage {
            input_tokens: 100,
            output_tokens: 20,
            cost_usd: 0.001,
        }),
    }
}

pub fn http_error(status: u16) -> ProviderError {
    ProviderError::HttpError {
        status,
        body: format!("status {status}"),
    }
}

// ─── ScriptedProvider ───────────────────────────────────────────────────────

/// Replays a fixed script of responses, then repeats `fallback` forever.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ModelResponse, ProviderError>>>,
    fallback: Option<ModelResponse>,
    calls: AtomicUsize,
    resets: AtomicUsize,
    /// Message count of each request, in call order.
    seen_lengths: Mutex<Vec<usize>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<ModelResponse, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            calls: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            seen_lengths: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, response: ModelResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn seen_lengths(&self) -> Vec<usize> {
        self.seen_lengths.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<ModelResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_lengths.lock().unwrap().push(request.messages.len());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => self.fallback.clone().ok_or_else(|| ProviderError::MalformedResponse {
                reason: "script exhausted".into(),
            }),
        }
    }

    fn reset_connection(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

// ─── Fake Tools ─────────────────────────────────────────────────────────────

/// Read-class tool that returns its `text` argument.
pub struct EchoTool {
    spec: ToolSpec,
    calls: Arc<AtomicUsize>,
}

impl EchoTool {
    pub fn new(name: &str) -> Self {
        Self {
            spec: ToolSpec::new(name, "Echo the text back", EffectClass::Read).with_schema(json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared invocation counter.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, arguments: serde_json::Value) -> anyhow::Result<ToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = arguments["text"].as_str().unwrap_or_default();
        Ok(ToolOutput::Text(text.to_string()))
    }
}

/// Write-class tool that writes `content` to `path`.
pub struct WriteFileTool {
    spec: ToolSpec,
    calls: Arc<AtomicUsize>,
}

impl WriteFileTool {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec::new("write_file", "Write a file", EffectClass::Write)
                .with_schema(json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "content": { "type": "string" }
                    },
                    "required": ["path", "content"]
                }))
                .with_path_arg("path"),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, arguments: serde_json::Value) -> anyhow::Result<ToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let path = arguments["path"].as_str().unwrap_or_default();
        let content = arguments["content"].as_str().unwrap_or_default();
        std::fs::write(path, content)?;
        Ok(ToolOutput::Text(format!("wrote {} bytes", content.len())))
    }
}

/// How a [`MisbehavingTool`] misbehaves.
#[derive(Debug, Clone, Copy)]
pub enum Misbehavior {
    Fail,
    Panic,
    Hang(Duration),
    /// Return this many characters of output.
    Flood(usize),
}

/// Read-class tool that fails, panics, hangs or floods output.
pub struct MisbehavingTool {
    spec: ToolSpec,
    mode: Misbehavior,
}

impl MisbehavingTool {
    pub fn new(name: &str, mode: Misbehavior) -> Self {
        Self {
            spec: ToolSpec::new(name, "Misbehaves", EffectClass::Read),
            mode,
        }
    }
}

#[async_trait]
impl Tool for MisbehavingTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, _arguments: serde_json::Value) -> anyhow::Result<ToolOutput> {
        match self.mode {
            Misbehavior::Fail => anyhow::bail!("disk on fire"),
            Misbehavior::Panic => panic!("tool exploded"),
            Misbehavior::Hang(d) => {
                tokio::time::sleep(d).await;
                Ok(ToolOutput::Text("late".into()))
            }
            Misbehavior::Flood(n) => Ok(ToolOutput::Text("x".repeat(n))),
        }
    }
}

// ─── Session Builders ───────────────────────────────────────────────────────

/// Defaults suitable for tests: no audit DB, prompts off, root at `root`.
pub fn test_config(root: &Path) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.policy.root = root.to_path_buf();
    config.policy.require_permission = false;
    config.audit.enabled = false;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 100;
    config
}

pub fn registry_with(tools: Vec<Arc<dyn Tool>>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool);
    }
    registry
}

pub fn services(
    config: RuntimeConfig,
    provider: Arc<dyn CompletionProvider>,
    tools: Vec<Arc<dyn Tool>>,
) -> SessionServices {
    services_with_confirmation(config, provider, tools, Arc::new(AutoApprove))
}

pub fn services_with_confirmation(
    config: RuntimeConfig,
    provider: Arc<dyn CompletionProvider>,
    tools: Vec<Arc<dyn Tool>>,
    confirmation: Arc<dyn ConfirmationChannel>,
) -> SessionServices {
    let context = RuntimeContext::ephemeral(config.limits.max_operations);
    SessionServices::builder(config, provider, registry_with(tools))
        .confirmation(confirmation)
        .context(Arc::new(context))
        .build()
        .unwrap()
}

/// A session with in-memory grants.
pub fn session(
    config: RuntimeConfig,
    provider: Arc<dyn CompletionProvider>,
    tools: Vec<Arc<dyn Tool>>,
) -> ConversationSession {
    ConversationSession::with_grants(services(config, provider, tools), PermissionStore::in_memory())
}

//! Shared types for the completion layer.
//!
//! [`CompletionRequest`] and [`ModelResponse`] are what sessions and
//! providers exchange. The `Chat*` types mirror the OpenAI Chat Completions
//! wire format used by the HTTP provider.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::ProviderError;
use crate::agent_core::types::{Message, Role as TranscriptRole, ToolCallRequest};

// ─── Provider Interface Types ────────────────────────────────────────────────

/// One completion request: the system prompt, the transcript and the tools
/// on offer. Borrowed so retries never copy the transcript.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub system_prompt: Option<&'a str>,
    pub messages: &'a [Message],
    /// OpenAI-format tool definitions.
    pub tools: &'a [serde_json::Value],
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// A parsed model reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<TokenUsage>,
}

// ─── Wire Request Types ──────────────────────────────────────────────────────

/// A single message in the conversation.
///
/// `content` is serialized as `""` (not `null`) for assistant messages with
/// tool calls; many OpenAI-compatible local runtimes reject `null` there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(serialize_with = "serialize_content")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallResponse>>,
}

fn serialize_content<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(s) => serializer.serialize_str(s),
        None => serializer.serialize_str(""),
    }
}

/// Wire message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Tool call as carried in the OpenAI format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCallResponse,
}

/// Function call details; `arguments` is a JSON string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub name: String,
    pub arguments: String,
}

/// Request body for `POST /chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "<[serde_json::Value]>::is_empty")]
    pub tools: &'a [serde_json::Value],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<&'static str>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

/// Convert the transcript into wire messages, prefixed by the system prompt.
pub fn to_chat_messages(system_prompt: Option<&str>, messages: &[Message]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if let Some(prompt) = system_prompt {
        out.push(ChatMessage {
            role: ChatRole::System,
            content: Some(prompt.to_string()),
            tool_call_id: None,
            tool_calls: None,
        });
    }
    for m in messages {
        let msg = match m.role() {
            TranscriptRole::User => ChatMessage {
                role: ChatRole::User,
                content: m.text().map(str::to_string),
                tool_call_id: None,
                tool_calls: None,
            },
            TranscriptRole::Assistant => ChatMessage {
                role: ChatRole::Assistant,
                content: m.text().map(str::to_string),
                tool_call_id: None,
                tool_calls: (!m.tool_calls().is_empty()).then(|| {
                    m.tool_calls()
                        .iter()
                        .map(|c| ToolCallResponse {
                            id: c.id.clone(),
                            r#type: "function".to_string(),
                            function: FunctionCallResponse {
                                name: c.name.clone(),
                                arguments: c.arguments.to_string(),
                            },
                        })
                        .collect()
                }),
            },
            TranscriptRole::Tool => ChatMessage {
                role: ChatRole::Tool,
                content: m.tool_result().map(|r| r.model_text()),
                tool_call_id: m.tool_result().map(|r| r.call_id.clone()),
                tool_calls: None,
            },
        };
        out.push(msg);
    }
    out
}

// ─── Wire Response Types ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: Option<String>,
    function: FunctionCallResponse,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Parse a non-streaming completion body.
///
/// Tool call arguments that are not valid JSON are kept as a raw string so
/// the dispatcher reports them to the model as invalid arguments. Missing
/// call IDs are generated.
pub fn parse_completion_response(
    body: &str,
    input_cost_per_mtok: f64,
    output_cost_per_mtok: f64,
) -> Result<ModelResponse, ProviderError> {
    let resp: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::MalformedResponse {
            reason: format!("failed to parse completion response: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::MalformedResponse {
            reason: "empty choices array".into(),
        })?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCallRequest {
            id: tc
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
            arguments: serde_json::from_str(&tc.function.arguments)
                .unwrap_or(serde_json::Value::String(tc.function.arguments)),
            name: tc.function.name,
        })
        .collect();

    let usage = resp.usage.map(|u| TokenUsage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        cost_usd: (u.prompt_tokens as f64 * input_cost_per_mtok
            + u.completion_tokens as f64 * output_cost_per_mtok)
            / 1_000_000.0,
    });

    Ok(ModelResponse {
        text: choice.message.content.filter(|c| !c.is_empty()),
        tool_calls,
        usage,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

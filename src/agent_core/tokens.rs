//! Token estimation for context window management.
//!
//! Uses character-based heuristics calibrated for LLM tokenizers:
//! - English prose: ~3.2 chars/token, rounded to overestimate
//! - JSON/structured content: ~2.8 chars/token (denser due to punctuation, short keys)
//!
//! Estimates are deterministic and monotonic in content length. The transcript
//! caches each message's estimate at append time, so the running total is
//! always the exact sum of per-message estimates.

use crate::agent_core::types::{MessageBody, Role};
use crate::tools::ToolOutput;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Average characters per token for English prose.
///
/// Most LLM tokenizers produce ~3.5-4.0 chars/token for English text. 3.2
/// errs on the side of overestimation.
const CHARS_PER_TOKEN: f64 = 3.2;

/// Average characters per token for JSON/structured content.
///
/// Tool call arguments, tool results, and schema definitions all fall into
/// this category.
const JSON_CHARS_PER_TOKEN: f64 = 2.8;

/// Per-message overhead (role label, formatting tokens).
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Overhead for tool call JSON structure (per call).
const TOOL_CALL_OVERHEAD_TOKENS: u32 = 10;

/// Flat charge for a binary tool output (the payload is not sent as text).
const BLOB_OUTPUT_TOKENS: u32 = 85;

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
///
/// If the byte at `max_bytes` is inside a multi-byte character, the slice is
/// shortened to the preceding character boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Estimator ──────────────────────────────────────────────────────────────

/// Maps a message to an approximate token count.
///
/// Implementations must be deterministic and must never report fewer tokens
/// for a message that only gained content.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, body: &MessageBody) -> u32;
}

/// The default character-ratio estimator.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, body: &MessageBody) -> u32 {
        estimate_message_tokens(body)
    }
}

// ─── Public API ─────────────────────────────────────────────────────────────

/// Estimate the token count for a string of natural language text.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.len() as f64;
    (chars / CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for JSON/structured content.
pub fn estimate_json_tokens(json_text: &str) -> u32 {
    let chars = json_text.len() as f64;
    (chars / JSON_CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for a message body.
///
/// Prose estimator for user/assistant text, JSON estimator for tool call
/// arguments and tool results.
pub fn estimate_message_tokens(body: &MessageBody) -> u32 {
    let mut total = MESSAGE_OVERHEAD_TOKENS;

    if let Some(ref text) = body.text {
        total += match body.role {
            Role::Tool => estimate_json_tokens(text),
            _ => estimate_tokens(text),
        };
    }

    for call in &body.tool_calls {
        total += TOOL_CALL_OVERHEAD_TOKENS;
        total += estimate_tokens(&call.id);
        total += estimate_tokens(&call.name);
        total += estimate_json_tokens(&call.arguments.to_string());
    }

    if let Some(ref result) = body.tool_result {
        total += estimate_tokens(&result.call_id);
        total += match &result.output {
            ToolOutput::Text(text) => estimate_json_tokens(text),
            ToolOutput::Blob { caption, .. } => {
                BLOB_OUTPUT_TOKENS + caption.as_deref().map(estimate_tokens).unwrap_or(0)
            }
        };
    }

    total
}

/// Summarize a tool result into a one-line string.
///
/// Used when compacting old tool exchanges.
pub fn summarize_tool_result(tool_name: &str, success: bool, output: &str) -> String {
    let status = if success { "returned" } else { "failed" };
    let token_count = estimate_json_tokens(output);

    if token_count <= 20 {
        format!("[{tool_name} {status}: {output}]")
    } else {
        let preview = truncate_utf8(output, 60);
        format!("[{tool_name} {status} ~{token_count} tokens: {preview}...]")
    }
}

/// Build a one-line summary of a transcript message.
pub fn summarize_turn(role: Role, content: Option<&str>) -> String {
    match role {
        Role::User => {
            let text = content.unwrap_or("[empty]");
            format!("User: {}", truncate_utf8(text, 80))
        }
        Role::Assistant => {
            let text = content.unwrap_or("[tool calls]");
            format!("Assistant: {}", truncate_utf8(text, 80))
        }
        Role::Tool => {
            let text = content.unwrap_or("[result]");
            format!("Tool result: {}", truncate_utf8(text, 60))
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

//! Shared types for the agent core.
//!
//! Transcript messages, tool call requests/results, permission decisions,
//! confirmation and audit types used across the session, dispatcher and
//! budget manager.

use serde::{Deserialize, Serialize};

use crate::tools::ToolOutput;

// ─── Roles ──────────────────────────────────────────────────────────────────

/// Who authored a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

// ─── Tool Calls ─────────────────────────────────────────────────────────────

/// A structured request, emitted by the model, to invoke a named tool.
///
/// Consumed exactly once by the dispatcher and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Call ID generated by the model response.
    pub id: String,
    /// Registered tool name.
    pub name: String,
    /// Argument mapping (expected to be a JSON object).
    pub arguments: serde_json::Value,
}

/// Outcome of executing (or refusing) one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Back-reference to the request this result answers.
    pub call_id: String,
    /// Tool that was requested.
    pub tool_name: String,
    /// Output payload shown to the model.
    pub output: ToolOutput,
    /// Whether the tool ran and succeeded.
    pub success: bool,
    /// Wall-clock duration of the dispatch (ms).
    pub duration_ms: u64,
}

impl ToolResult {
    /// Build a failed result carrying an explanatory message.
    pub fn failure(call: &ToolCallRequest, message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            output: ToolOutput::Text(message.into()),
            success: false,
            duration_ms,
        }
    }

    /// Text the model sees for this result.
    pub fn model_text(&self) -> String {
        self.output.model_text()
    }
}

// ─── Messages ───────────────────────────────────────────────────────────────

/// The payload of a transcript message, before the store stamps it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBody {
    pub role: Role,
    /// Free text (user prompt, assistant reply, compaction summary).
    pub text: Option<String>,
    /// Tool calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// For `tool` role: the result being reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
    /// Inserted by the runtime (compaction summary, subtask result).
    #[serde(default)]
    pub synthetic: bool,
}

impl MessageBody {
    /// A user prompt.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: Some(text.into()),
            tool_calls: Vec::new(),
            tool_result: None,
            synthetic: false,
        }
    }

    /// A plain assistant reply.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: Some(text.into()),
            tool_calls: Vec::new(),
            tool_result: None,
            synthetic: false,
        }
    }

    /// An assistant turn that requests tool calls (optionally with text).
    pub fn assistant_tool_calls(text: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            text,
            tool_calls: calls,
            tool_result: None,
            synthetic: false,
        }
    }

    /// A tool result message.
    pub fn tool(result: ToolResult) -> Self {
        Self {
            role: Role::Tool,
            text: None,
            tool_calls: Vec::new(),
            tool_result: Some(result),
            synthetic: false,
        }
    }

    /// A runtime-authored assistant message.
    pub fn synthetic(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: Some(text.into()),
            tool_calls: Vec::new(),
            tool_result: None,
            synthetic: true,
        }
    }
}

/// A message stored in the transcript. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Sequence number assigned at append; increases with position and
    /// survives compaction. A compaction summary takes the first ordinal it
    /// replaces.
    pub ordinal: u64,
    /// ISO 8601 timestamp.
    pub timestamp: String,
    /// Estimated token count for this message.
    pub token_count: u32,
    pub body: MessageBody,
}

impl Message {
    pub fn role(&self) -> Role {
        self.body.role
    }

    pub fn text(&self) -> Option<&str> {
        self.body.text.as_deref()
    }

    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        &self.body.tool_calls
    }

    pub fn tool_result(&self) -> Option<&ToolResult> {
        self.body.tool_result.as_ref()
    }

    pub fn is_synthetic(&self) -> bool {
        self.body.synthetic
    }
}

// ─── Permission Decisions ───────────────────────────────────────────────────

/// Result of evaluating a tool call against the permission policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow { reason: String },
    Deny { reason: String },
    RequireConfirmation { reason: String },
}

impl PermissionDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self::Allow {
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    pub fn confirm(reason: impl Into<String>) -> Self {
        Self::RequireConfirmation {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Allow { reason } | Self::Deny { reason } | Self::RequireConfirmation { reason } => {
                reason
            }
        }
    }
}

// ─── Confirmation ───────────────────────────────────────────────────────────

/// Request sent to the confirmation channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRequest {
    /// Unique request ID for matching responses.
    pub request_id: String,
    /// Session that issued the request.
    pub session_id: String,
    /// The tool being called.
    pub tool_name: String,
    /// The arguments to the tool.
    pub arguments: serde_json::Value,
    /// Human-readable preview of what will happen.
    pub preview: String,
    /// Why the gate asked for confirmation.
    pub reason: String,
}

/// Response from the confirmation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConfirmationResponse {
    /// Allow this call only.
    Confirmed,
    /// Allow matching calls for the rest of the session.
    ConfirmedForSession,
    /// Allow matching calls permanently.
    ConfirmedAlways,
    /// Refuse the call.
    Rejected,
}

// ─── Audit Log ──────────────────────────────────────────────────────────────

/// A single entry in the tool execution audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Auto-incremented row ID.
    pub id: i64,
    /// Session this entry belongs to.
    pub session_id: String,
    /// ISO 8601 timestamp.
    pub timestamp: String,
    /// Operation kind (the tool name).
    pub operation: String,
    /// Target of the operation (path, command, or argument preview).
    pub target: String,
    /// Outcome.
    pub status: AuditStatus,
    /// Extra detail: error text, denial reason, backup path.
    pub detail: Option<String>,
    /// How long the dispatch took (ms).
    pub execution_time_ms: u64,
}

/// Input for a new audit entry (no DB fields).
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub session_id: String,
    pub operation: String,
    pub target: String,
    pub status: AuditStatus,
    pub detail: Option<String>,
    pub execution_time_ms: u64,
}

/// Status of a tool dispatch in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    /// Tool executed successfully.
    Success,
    /// Tool ran and failed (error, panic, timeout).
    Error,
    /// Blocked by the permission gate.
    Denied,
    /// Confirmation refused or timed out.
    RejectedByUser,
}

impl AuditStatus {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Error => "error",
            AuditStatus::Denied => "denied",
            AuditStatus::RejectedByUser => "rejected_by_user",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Self {
        match s {
            "success" => AuditStatus::Success,
            "denied" => AuditStatus::Denied,
            "rejected_by_user" => AuditStatus::RejectedByUser,
            _ => AuditStatus::Error,
        }
    }
}

// ─── Usage Counters ─────────────────────────────────────────────────────────

/// Per-session resource usage, merged from subtasks into their parent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub llm_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub tool_calls: u64,
}

impl UsageCounters {
    /// Add another session's counters into this one.
    pub fn merge(&mut self, other: &UsageCounters) {
        self.llm_calls += other.llm_calls;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
        self.tool_calls += other.tool_calls;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

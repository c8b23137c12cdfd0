//! Agent Core error types.
//!
//! Errors are split by the component that raises them. [`SessionError`] is
//! what callers of the session, autopilot loop and subtask runner see; the
//! other enums convert into it.

use thiserror::Error;

use super::gate::GateBuildError;
use crate::config::ConfigError;
use crate::inference::ProviderError;

/// Violations of the transcript's tool-call pairing rules.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranscriptError {
    /// A tool result references a call that is not awaiting a result.
    #[error("tool result for '{call_id}' does not answer any open tool call")]
    OrphanToolResult { call_id: String },

    /// A tool message was appended without a result payload.
    #[error("tool message is missing its result payload")]
    MissingToolResult,

    /// Two calls in the same request share an ID.
    #[error("duplicate tool call id '{call_id}'")]
    DuplicateCallId { call_id: String },

    /// A non-tool message was appended while calls still await results.
    #[error("tool calls still awaiting results: {}", call_ids.join(", "))]
    UnresolvedToolCalls { call_ids: Vec<String> },

    /// A range operation would split a tool exchange or is out of bounds.
    #[error("invalid transcript range {start}..{end}: {reason}")]
    InvalidRange {
        start: usize,
        end: usize,
        reason: String,
    },
}

/// Compaction could not bring the transcript under its threshold.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompactionError {
    #[error(
        "compaction ineffective: {before} -> {after} tokens, threshold {threshold_tokens} \
         of {hard_limit}; lower prune_protect/prune_minimum or raise the context limit"
    )]
    Ineffective {
        before: u64,
        after: u64,
        threshold_tokens: u64,
        hard_limit: u64,
    },

    /// Splicing the summary into the transcript failed.
    #[error("compaction splice failed: {0}")]
    Transcript(#[from] TranscriptError),
}

/// Errors from the tool dispatcher.
///
/// Only [`DispatchError::is_fatal`] variants end the session; the rest are
/// turned into failed tool results the model can react to.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The model asked for a tool that is not registered.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// Arguments do not satisfy the tool's declared schema.
    #[error("invalid arguments for '{tool_name}': {reason}")]
    InvalidArguments { tool_name: String, reason: String },

    /// The session-wide operation budget is spent.
    #[error("operation limit exceeded: {count} of {limit} operations used; raise limits.max_operations")]
    OperationLimitExceeded { count: u64, limit: u64 },
}

impl DispatchError {
    /// Whether this error must terminate the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::OperationLimitExceeded { .. })
    }
}

/// Errors surfaced by a conversation session and its drivers.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The provider failed fatally or retries were exhausted.
    #[error("model provider failed: {0}")]
    ProviderFatal(#[source] ProviderError),

    /// Compaction could not make room for the next request.
    #[error("context budget exceeded: {0}")]
    BudgetExceeded(#[source] CompactionError),

    /// A hard resource limit was hit.
    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(#[source] DispatchError),

    /// The transcript pairing rules were violated.
    #[error("transcript consistency violation: {0}")]
    Consistency(#[from] TranscriptError),

    /// The turn used its step allowance without a final reply.
    #[error("turn incomplete after {steps} steps; the model is still requesting tools")]
    TurnIncomplete { steps: usize },

    /// Cancellation was requested.
    #[error("session cancelled")]
    Cancelled,

    /// The session is in its terminal error state.
    #[error("session '{session_id}' is in an error state and cannot continue")]
    SessionErrored { session_id: String },
}

impl SessionError {
    /// Whether the session remains usable after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::TurnIncomplete { .. }
                | SessionError::BudgetExceeded(_)
                | SessionError::Cancelled
        )
    }
}

/// Errors from the audit log backend.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    #[error("audit log I/O error: {reason}")]
    Io { reason: String },
}

impl From<rusqlite::Error> for AuditError {
    fn from(e: rusqlite::Error) -> Self {
        AuditError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<std::io::Error> for AuditError {
    fn from(e: std::io::Error) -> Self {
        AuditError::Io {
            reason: e.to_string(),
        }
    }
}

/// Errors assembling session services from configuration.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("permission rules failed to compile: {0}")]
    Gate(#[from] GateBuildError),

    #[error("audit log unavailable: {0}")]
    Audit(#[from] AuditError),

    #[error("provider setup failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("no provider configured; add a `provider:` section with base_url and model")]
    MissingProvider,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_fatality() {
        assert!(DispatchError::OperationLimitExceeded { count: 11, limit: 10 }.is_fatal());
        assert!(!DispatchError::UnknownTool { name: "x".into() }.is_fatal());
        assert!(!DispatchError::InvalidArguments {
            tool_name: "x".into(),
            reason: "missing 'path'".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_session_error_recoverability() {
        assert!(SessionError::TurnIncomplete { steps: 3 }.is_recoverable());
        assert!(SessionError::Cancelled.is_recoverable());
        assert!(!SessionError::ProviderFatal(ProviderError::HttpError {
            status: 401,
            body: "unauthorized".into(),
        })
        .is_recoverable());
    }

    #[test]
    fn test_messages_are_actionable() {
        let err = SessionError::ResourceLimitExceeded(DispatchError::OperationLimitExceeded {
            count: 10_001,
            limit: 10_000,
        });
        assert!(err.to_string().contains("max_operations"));

        let err = CompactionError::Ineffective {
            before: 900,
            after: 880,
            threshold_tokens: 750,
            hard_limit: 1000,
        };
        assert!(err.to_string().contains("880"));
    }

    #[test]
    fn test_unresolved_lists_ids() {
        let err = TranscriptError::UnresolvedToolCalls {
            call_ids: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "tool calls still awaiting results: a, b");
    }
}

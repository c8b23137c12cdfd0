//! Agent Core: the orchestration runtime.
//!
//! Submodules:
//! - `transcript`: Ordered message history with tool-call pairing rules
//! - `tokens`: Token estimation for context budgets
//! - `gate`: Permission rules (dangerous commands, sensitive files, root scope)
//! - `permissions`: Session and persistent grants
//! - `confirmation`: Out-of-band approval channels
//! - `tool_router`: Dispatches model tool calls through the gate
//! - `resources`: Operation counter, backups, cancellation
//! - `audit`: SQLite audit log
//! - `budget`: Context budget tracking and compaction
//! - `conversation`: The session state machine
//! - `autopilot`: Fixed-prompt loop with completion detection
//! - `subtask`: Isolated child sessions
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod audit;
pub mod autopilot;
pub mod budget;
pub mod confirmation;
pub mod conversation;
pub mod errors;
pub mod gate;
pub mod permissions;
pub mod resources;
pub mod subtask;
pub mod tokens;
pub mod tool_router;
pub mod transcript;
pub mod types;

// Re-exports for convenience
pub use audit::{AuditSink, NullAuditSink, SqliteAuditLog};
pub use autopilot::{AutopilotLoop, AutopilotOutcome, CompletionCheck, FailureReport, LoopState};
pub use budget::{
    BudgetState, CompactionOutcome, ContextBudgetManager, ModelSummarizer, Summarizer,
    TruncationSummarizer,
};
pub use confirmation::{AutoApprove, AutoDeny, ChannelConfirmation, ConfirmationChannel};
pub use conversation::{
    ConversationSession, SessionServices, SessionServicesBuilder, SessionState, StepOutcome,
};
pub use errors::{
    AuditError, CompactionError, DispatchError, SessionError, SetupError, TranscriptError,
};
pub use gate::PermissionGate;
pub use permissions::{PermissionScope, PermissionStore};
pub use resources::{BackupStore, CancellationFlag, OperationCounter, RuntimeContext};
pub use subtask::{SubtaskHandle, SubtaskReport, SubtaskRunner};
pub use tokens::{HeuristicEstimator, TokenEstimator};
pub use tool_router::ToolDispatcher;
pub use transcript::TranscriptStore;
pub use types::{
    AuditEntry, AuditStatus, ConfirmationRequest, ConfirmationResponse, Message, MessageBody,
    PermissionDecision, Role, ToolCallRequest, ToolResult, UsageCounters,
};

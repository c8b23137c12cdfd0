//! ToolDispatcher: routes model tool calls to registered tools.
//!
//! The dispatcher is the bridge between the model's tool call decisions and
//! the tools themselves. For each call it handles:
//! - Validation (tool exists, arguments match schema)
//! - Permission evaluation and the confirmation flow
//! - The session-wide operation limit
//! - File backups before write-class tools run
//! - Execution under a hard timeout, with panics contained
//! - Output truncation and audit logging
//!
//! Tool failures, denials, refusals, timeouts and panics all come back as
//! failed [`ToolResult`]s so the model can react. Only an exhausted
//! operation budget is fatal.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;

use super::confirmation::ConfirmationChannel;
use super::errors::DispatchError;
use super::gate::{grant_pattern, resolve_path, PermissionGate};
use super::permissions::{PermissionScope, PermissionStore};
use super::resources::RuntimeContext;
use super::tokens::truncate_utf8;
use super::types::{
    AuditStatus, ConfirmationRequest, ConfirmationResponse, NewAuditEntry, PermissionDecision,
    ToolCallRequest, ToolResult,
};
use crate::config::RuntimeConfig;
use crate::tools::{EffectClass, ToolOutput, ToolRegistry, ToolSpec};

// ─── ToolDispatcher ─────────────────────────────────────────────────────────

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    gate: Arc<PermissionGate>,
    config: Arc<RuntimeConfig>,
    context: Arc<RuntimeContext>,
    confirmation: Arc<dyn ConfirmationChannel>,
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("registry", &self.registry)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        gate: Arc<PermissionGate>,
        config: Arc<RuntimeConfig>,
        context: Arc<RuntimeContext>,
        confirmation: Arc<dyn ConfirmationChannel>,
    ) -> Self {
        Self {
            registry,
            gate,
            config,
            context,
            confirmation,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Dispatch a single tool call:
    /// validate → evaluate → confirm → size check → count → back up → execute → audit.
    ///
    /// `UnknownTool` and `InvalidArguments` are returned as errors (after
    /// being audited) so the caller can decide how to report them.
    pub async fn dispatch(
        &self,
        call: &ToolCallRequest,
        grants: &mut PermissionStore,
        session_id: &str,
    ) -> Result<ToolResult, DispatchError> {
        let start = Instant::now();

        // 1. Validate
        let tool = match self.registry.validate_call(&call.name, &call.arguments) {
            Ok(tool) => tool.clone(),
            Err(e) => {
                tracing::warn!(tool = %call.name, call_id = %call.id, error = %e, "tool call rejected");
                self.audit(session_id, call, None, AuditStatus::Error, Some(e.to_string()), start);
                return Err(e);
            }
        };
        let spec = tool.spec();

        // 2. Permission gate
        let decision = self
            .gate
            .evaluate(spec, &call.arguments, &self.config.policy, grants);
        tracing::debug!(tool = %call.name, decision = ?decision, "permission evaluated");

        match decision {
            PermissionDecision::Allow { .. } => {}
            PermissionDecision::Deny { reason } => {
                tracing::info!(tool = %call.name, reason = %reason, "tool call denied");
                self.audit(session_id, call, Some(spec), AuditStatus::Denied, Some(reason.clone()), start);
                return Ok(ToolResult::failure(
                    call,
                    format!("Permission denied: {reason}"),
                    elapsed_ms(start),
                ));
            }
            PermissionDecision::RequireConfirmation { reason } => {
                // 3. Confirmation flow
                let response = self.confirm(call, spec, session_id, &reason).await;
                let pattern = grant_pattern(spec, &call.arguments);
                match response {
                    ConfirmationResponse::Confirmed => {}
                    ConfirmationResponse::ConfirmedForSession => {
                        grants.grant(&call.name, pattern.as_deref(), PermissionScope::Session);
                    }
                    ConfirmationResponse::ConfirmedAlways => {
                        grants.grant(&call.name, pattern.as_deref(), PermissionScope::Always);
                    }
                    ConfirmationResponse::Rejected => {
                        self.audit(
                            session_id,
                            call,
                            Some(spec),
                            AuditStatus::RejectedByUser,
                            Some(reason),
                            start,
                        );
                        return Ok(ToolResult::failure(
                            call,
                            "Operation cancelled: the user did not approve this call.",
                            elapsed_ms(start),
                        ));
                    }
                }
            }
        }

        // 4. File size limit
        if let Some(msg) = self.oversized_file(spec, &call.arguments) {
            tracing::warn!(tool = %call.name, "{msg}");
            self.audit(session_id, call, Some(spec), AuditStatus::Error, Some(msg.clone()), start);
            return Ok(ToolResult::failure(call, msg, elapsed_ms(start)));
        }

        // 5. Operation limit
        if let Err(e) = self.context.operations.try_acquire() {
            tracing::error!(tool = %call.name, error = %e, "operation limit exceeded");
            self.audit(session_id, call, Some(spec), AuditStatus::Denied, Some(e.to_string()), start);
            return Err(e);
        }

        // 6. Backups
        let mut backup_note = None;
        if spec.effect == EffectClass::Write {
            match self.back_up(spec, &call.arguments) {
                Ok(note) => backup_note = note,
                Err(e) => {
                    let msg = format!("backup failed, call not executed: {e}");
                    tracing::error!(tool = %call.name, error = %e, "backup failed");
                    self.audit(session_id, call, Some(spec), AuditStatus::Error, Some(msg.clone()), start);
                    return Ok(ToolResult::failure(call, msg, elapsed_ms(start)));
                }
            }
        }

        // 7. Execute
        let timeout = self.timeout_for(spec.effect);
        let outcome = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(tool.execute(call.arguments.clone())).catch_unwind(),
        )
        .await;

        let (output, success, error) = match outcome {
            Ok(Ok(Ok(output))) => (output, true, None),
            Ok(Ok(Err(e))) => {
                let msg = format!("Error: {e:#}");
                (ToolOutput::Text(msg.clone()), false, Some(msg))
            }
            Ok(Err(panic)) => {
                let msg = format!("Error: tool panicked: {}", panic_message(panic.as_ref()));
                tracing::error!(tool = %call.name, "{msg}");
                (ToolOutput::Text(msg.clone()), false, Some(msg))
            }
            Err(_) => {
                let msg = format!("Error: tool timed out after {}s", timeout.as_secs());
                tracing::warn!(tool = %call.name, timeout_secs = timeout.as_secs(), "tool timed out");
                (ToolOutput::Text(msg.clone()), false, Some(msg))
            }
        };

        let output = truncate_output(output, self.config.limits.max_tool_output_chars);
        let detail = match (error, backup_note) {
            (Some(e), Some(b)) => Some(format!("{e}; {b}")),
            (e, b) => e.or(b),
        };
        let status = if success {
            AuditStatus::Success
        } else {
            AuditStatus::Error
        };
        self.audit(session_id, call, Some(spec), status, detail, start);

        let elapsed = elapsed_ms(start);
        tracing::info!(
            tool = %call.name,
            call_id = %call.id,
            success,
            elapsed_ms = elapsed,
            "tool call complete"
        );

        Ok(ToolResult {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            output,
            success,
            duration_ms: elapsed,
        })
    }

    // ─── Helpers ────────────────────────────────────────────────────────

    /// Ask the confirmation channel. Timeouts and closed channels deny.
    async fn confirm(
        &self,
        call: &ToolCallRequest,
        spec: &ToolSpec,
        session_id: &str,
        reason: &str,
    ) -> ConfirmationResponse {
        let request = ConfirmationRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            preview: generate_preview(spec, &call.arguments),
            reason: reason.to_string(),
        };
        let wait = Duration::from_secs(self.config.limits.confirmation_timeout_secs);

        match tokio::time::timeout(wait, self.confirmation.confirm(request)).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                tracing::warn!(tool = %call.name, "confirmation channel closed, denying");
                ConfirmationResponse::Rejected
            }
            Err(_) => {
                tracing::warn!(tool = %call.name, timeout_secs = wait.as_secs(), "confirmation timed out, denying");
                ConfirmationResponse::Rejected
            }
        }
    }

    /// Message for the first existing file a read or write tool names that is
    /// larger than `limits.max_file_size`.
    fn oversized_file(&self, spec: &ToolSpec, arguments: &serde_json::Value) -> Option<String> {
        if !matches!(spec.effect, EffectClass::Read | EffectClass::Write) {
            return None;
        }
        let max = self.config.limits.max_file_size;
        spec.paths(arguments).into_iter().find_map(|path| {
            let resolved = resolve_path(&self.config.policy.root, path);
            let size = std::fs::metadata(&resolved).ok().filter(|m| m.is_file())?.len();
            (size > max).then(|| {
                format!("File too large: {path} is {size} bytes (max {max}); raise limits.max_file_size")
            })
        })
    }

    /// Back up every existing file a write tool names.
    fn back_up(&self, spec: &ToolSpec, arguments: &serde_json::Value) -> std::io::Result<Option<String>> {
        let Some(store) = self.context.backups.as_ref() else {
            return Ok(None);
        };
        let mut saved = Vec::new();
        for path in spec.paths(arguments) {
            let resolved = resolve_path(&self.config.policy.root, path);
            if let Some(record) = store.snapshot(&resolved)? {
                saved.push(record.backup_path.display().to_string());
            }
        }
        Ok((!saved.is_empty()).then(|| format!("backup: {}", saved.join(", "))))
    }

    fn timeout_for(&self, effect: EffectClass) -> Duration {
        let secs = match effect {
            EffectClass::Exec => self.config.limits.shell_timeout_secs,
            _ => self.config.limits.tool_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    fn audit(
        &self,
        session_id: &str,
        call: &ToolCallRequest,
        spec: Option<&ToolSpec>,
        status: AuditStatus,
        detail: Option<String>,
        start: Instant,
    ) {
        let entry = NewAuditEntry {
            session_id: session_id.to_string(),
            operation: call.name.clone(),
            target: audit_target(spec, &call.arguments),
            status,
            detail,
            execution_time_ms: elapsed_ms(start),
        };
        if let Err(e) = self.context.audit.record(&entry) {
            tracing::warn!(error = %e, tool = %call.name, "failed to write audit entry");
        }
    }
}

// ─── Free Functions ─────────────────────────────────────────────────────────

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Cap text output at `max_chars` characters.
fn truncate_output(output: ToolOutput, max_chars: usize) -> ToolOutput {
    match output {
        ToolOutput::Text(text) => match text.char_indices().nth(max_chars) {
            Some((cut, _)) => {
                let total = text.chars().count();
                ToolOutput::Text(format!(
                    "{}\n[output truncated: showing {max_chars} of {total} characters]",
                    &text[..cut]
                ))
            }
            None => ToolOutput::Text(text),
        },
        blob => blob,
    }
}

/// What the audit log records as the target of a call.
fn audit_target(spec: Option<&ToolSpec>, arguments: &serde_json::Value) -> String {
    if let Some(spec) = spec {
        if let Some(cmd) = spec.command(arguments) {
            return truncate_utf8(cmd, 200).to_string();
        }
        let paths = spec.paths(arguments);
        if !paths.is_empty() {
            return paths.join(", ");
        }
    }
    truncate_utf8(&arguments.to_string(), 200).to_string()
}

/// Generate a human-readable preview for a tool call.
pub fn generate_preview(spec: &ToolSpec, arguments: &serde_json::Value) -> String {
    if let Some(cmd) = spec.command(arguments) {
        return format!("Run command: {cmd}");
    }
    let paths = spec.paths(arguments);
    let verb = match spec.effect {
        EffectClass::Read => "Read",
        EffectClass::Write => "Modify",
        EffectClass::Exec => "Execute",
        EffectClass::Network => "Fetch",
    };
    if paths.is_empty() {
        format!("{verb} via {}: {}", spec.name, truncate_utf8(&arguments.to_string(), 120))
    } else {
        format!("{verb} {}", paths.join(", "))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

//! SubtaskRunner: bounded work in an isolated child session.
//!
//! The child starts with an empty transcript and shares the parent's tools,
//! policy, runtime context and cancel flag. It runs like the autopilot loop.
//! Afterwards its usage is merged into the parent and exactly one synthetic
//! assistant message carrying the child's final text is appended to the
//! parent. None of the child's tool traffic reaches the parent transcript.

use super::autopilot::{AutopilotLoop, AutopilotOutcome};
use super::conversation::ConversationSession;
use super::errors::SessionError;
use super::types::UsageCounters;

/// An isolated child session, owned for the duration of one subtask.
#[derive(Debug)]
pub struct SubtaskHandle {
    parent_id: String,
    child: ConversationSession,
}

impl SubtaskHandle {
    pub fn spawn(parent: &ConversationSession) -> Self {
        Self {
            parent_id: parent.id().to_string(),
            child: parent.spawn_isolated(),
        }
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub fn child(&self) -> &ConversationSession {
        &self.child
    }

    /// Drive the child to completion or exhaustion. The child's usage is
    /// returned alongside the outcome so it can be merged even on error.
    pub async fn drive(
        mut self,
        task_prompt: &str,
        completion_signal: &str,
        max_iterations: usize,
    ) -> (Result<AutopilotOutcome, SessionError>, UsageCounters) {
        let result =
            AutopilotLoop::run(&mut self.child, task_prompt, completion_signal, max_iterations)
                .await;
        (result, self.child.usage().clone())
    }
}

/// What a subtask produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskReport {
    pub child_id: String,
    pub completed: bool,
    pub iterations: usize,
    /// The text injected into the parent transcript.
    pub final_text: String,
    /// Position of the injected message in the parent transcript.
    pub injected_at: usize,
    pub usage: UsageCounters,
}

pub struct SubtaskRunner;

impl SubtaskRunner {
    /// Run `task_prompt` in an isolated child and inject its result into
    /// `parent`.
    ///
    /// On a hard error the child's usage is still merged and the error is
    /// returned; nothing is injected.
    pub async fn run_subtask(
        parent: &mut ConversationSession,
        task_prompt: &str,
        completion_signal: &str,
        max_iterations: usize,
    ) -> Result<SubtaskReport, SessionError> {
        let handle = SubtaskHandle::spawn(parent);
        let child_id = handle.child().id().to_string();
        tracing::info!(
            parent_id = %handle.parent_id(),
            child_id = %child_id,
            max_iterations,
            "subtask started"
        );

        let (result, usage) = handle
            .drive(task_prompt, completion_signal, max_iterations)
            .await;
        parent.merge_usage(&usage);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(child_id = %child_id, error = %e, "subtask failed");
                return Err(e);
            }
        };

        let (completed, iterations, final_text) = match &outcome {
            AutopilotOutcome::Completed {
                response,
                iterations,
            } => (true, *iterations, response.clone()),
            AutopilotOutcome::Exhausted(report) => (
                false,
                report.iterations,
                format!("Subtask did not complete: {report}"),
            ),
        };

        let injected_at = parent.inject_synthetic(final_text.clone())?;
        tracing::info!(
            child_id = %child_id,
            completed,
            iterations,
            llm_calls = usage.llm_calls,
            tool_calls = usage.tool_calls,
            "subtask finished"
        );

        Ok(SubtaskReport {
            child_id,
            completed,
            iterations,
            final_text,
            injected_at,
            usage,
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

//! AutopilotLoop: resubmit one task prompt until the work says it is done.
//!
//! Each iteration runs a full `turn()` with the same literal prompt; the
//! evolving transcript carries progress. After every turn the latest
//! assistant reply is checked for completion. Reaching the iteration cap
//! yields a [`FailureReport`], never a silent stop.

use std::fmt;

use super::conversation::ConversationSession;
use super::errors::SessionError;
use super::transcript::TranscriptStore;
use super::types::{Role, UsageCounters};

// ─── Completion checks ──────────────────────────────────────────────────────

/// Decides whether a reply ends the loop.
pub trait CompletionCheck: Send + Sync {
    fn is_complete(&self, response: &str) -> bool;
}

impl<F> CompletionCheck for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_complete(&self, response: &str) -> bool {
        self(response)
    }
}

/// Completes when the reply contains the signal as a literal substring.
#[derive(Debug, Clone)]
pub struct SignalCheck {
    signal: String,
}

impl SignalCheck {
    pub fn new(signal: impl Into<String>) -> Self {
        Self {
            signal: signal.into(),
        }
    }
}

impl CompletionCheck for SignalCheck {
    fn is_complete(&self, response: &str) -> bool {
        response.contains(&self.signal)
    }
}

// ─── LoopState / outcome ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LoopState {
    pub iteration: usize,
    pub max_iterations: usize,
    pub completion_signal: String,
    /// Turns that hit the per-turn step ceiling.
    pub incomplete_turns: usize,
    pub last_response: Option<String>,
}

impl LoopState {
    pub fn new(completion_signal: impl Into<String>, max_iterations: usize) -> Self {
        Self {
            iteration: 0,
            max_iterations,
            completion_signal: completion_signal.into(),
            incomplete_turns: 0,
            last_response: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }
}

/// Why the loop stopped without seeing its completion signal.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub iterations: usize,
    pub max_iterations: usize,
    pub completion_signal: String,
    pub last_response: Option<String>,
    pub incomplete_turns: usize,
    /// Session usage when the loop gave up.
    pub usage: UsageCounters,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "completion signal '{}' not seen after {} of {} iterations",
            self.completion_signal, self.iterations, self.max_iterations
        )?;
        if self.incomplete_turns > 0 {
            write!(f, " ({} turns hit the step limit)", self.incomplete_turns)?;
        }
        match &self.last_response {
            Some(text) => write!(f, "; last response: {text}")?,
            None => write!(f, "; no text response was produced")?,
        }
        write!(
            f,
            ". Raise max_iterations (capped by limits.max_iterations) or make the prompt's completion criteria explicit."
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AutopilotOutcome {
    Completed { response: String, iterations: usize },
    Exhausted(FailureReport),
}

impl AutopilotOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, AutopilotOutcome::Completed { .. })
    }

    /// The text a caller should surface: the final reply, or the last one
    /// seen before giving up.
    pub fn final_text(&self) -> Option<&str> {
        match self {
            AutopilotOutcome::Completed { response, .. } => Some(response),
            AutopilotOutcome::Exhausted(report) => report.last_response.as_deref(),
        }
    }
}

// ─── AutopilotLoop ──────────────────────────────────────────────────────────

pub struct AutopilotLoop;

impl AutopilotLoop {
    /// Run until `completion_signal` appears in a reply or `max_iterations`
    /// turns have run. `limits.max_iterations` caps the request.
    pub async fn run(
        session: &mut ConversationSession,
        prompt: &str,
        completion_signal: &str,
        max_iterations: usize,
    ) -> Result<AutopilotOutcome, SessionError> {
        let check = SignalCheck::new(completion_signal);
        Self::run_with(session, prompt, completion_signal, max_iterations, &check).await
    }

    /// Like [`run`](Self::run) with a custom completion predicate.
    /// `completion_signal` is only used for reporting.
    pub async fn run_with(
        session: &mut ConversationSession,
        prompt: &str,
        completion_signal: &str,
        max_iterations: usize,
        check: &dyn CompletionCheck,
    ) -> Result<AutopilotOutcome, SessionError> {
        let ceiling = session.services().config.limits.max_iterations;
        if max_iterations > ceiling {
            tracing::info!(
                session_id = %session.id(),
                requested = max_iterations,
                ceiling,
                "iteration request capped by limits.max_iterations"
            );
        }
        let max_iterations = max_iterations.min(ceiling);
        let mut state = LoopState::new(completion_signal, max_iterations);

        while !state.is_exhausted() {
            state.iteration += 1;
            let before = session.transcript().messages().last().map(|m| m.ordinal);

            let response = match session.turn(prompt).await {
                Ok(text) => Some(text),
                Err(SessionError::TurnIncomplete { steps }) => {
                    state.incomplete_turns += 1;
                    tracing::info!(
                        session_id = %session.id(),
                        iteration = state.iteration,
                        steps,
                        "autopilot turn hit step limit"
                    );
                    latest_reply_since(session.transcript(), before)
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %session.id(),
                        iteration = state.iteration,
                        error = %e,
                        "autopilot stopped by error"
                    );
                    return Err(e);
                }
            };

            if let Some(text) = &response {
                if check.is_complete(text) {
                    tracing::info!(
                        session_id = %session.id(),
                        iterations = state.iteration,
                        "autopilot completed"
                    );
                    return Ok(AutopilotOutcome::Completed {
                        response: text.clone(),
                        iterations: state.iteration,
                    });
                }
            }
            if response.is_some() {
                state.last_response = response;
            }
            tracing::debug!(
                session_id = %session.id(),
                iteration = state.iteration,
                max_iterations,
                "completion signal not seen"
            );
        }

        let report = FailureReport {
            iterations: state.iteration,
            max_iterations,
            completion_signal: state.completion_signal,
            last_response: state.last_response,
            incomplete_turns: state.incomplete_turns,
            usage: session.usage().clone(),
        };
        tracing::warn!(session_id = %session.id(), report = %report, "autopilot exhausted");
        Ok(AutopilotOutcome::Exhausted(report))
    }
}

/// Newest non-synthetic assistant text appended after ordinal `after`.
fn latest_reply_since(transcript: &TranscriptStore, after: Option<u64>) -> Option<String> {
    transcript
        .messages()
        .iter()
        .rev()
        .take_while(|m| after.map_or(true, |a| m.ordinal > a))
        .filter(|m| m.role() == Role::Assistant && !m.is_synthetic())
        .find_map(|m| m.text().filter(|t| !t.is_empty()))
        .map(str::to_string)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

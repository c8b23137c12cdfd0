//! ConversationSession: the ask-model / dispatch-tools state machine.
//!
//! Responsibilities:
//! - Drive one model round-trip per `step()` and dispatch the requested tool
//!   calls sequentially, in the order the model returned them
//! - Chain steps into a `turn()` until a text-only reply or the step ceiling
//! - Run compaction before every model call and after every tool result
//! - Track usage (LLM calls, tokens, cost, tool calls)
//! - Enter the absorbing `Error` state on fatal failures
//!
//! States: `Idle → AwaitingModel → (ToolCallsPending | Responded) → Idle`,
//! with `Error` reachable from any of them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::budget::{
    BudgetState, ContextBudgetManager, ModelSummarizer, Summarizer, TruncationSummarizer,
};
use super::confirmation::{AutoDeny, ConfirmationChannel};
use super::errors::{CompactionError, SessionError, SetupError};
use super::gate::PermissionGate;
use super::permissions::PermissionStore;
use super::resources::{CancellationFlag, RuntimeContext};
use super::tokens::{HeuristicEstimator, TokenEstimator};
use super::tool_router::ToolDispatcher;
use super::transcript::TranscriptStore;
use super::types::{MessageBody, ToolCallRequest, ToolResult, UsageCounters};
use crate::config::RuntimeConfig;
use crate::inference::{
    CompletionProvider, CompletionRequest, HttpProvider, ModelResponse, RetryingCompletionClient,
};
use crate::tools::ToolRegistry;

// ─── SessionState ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingModel,
    ToolCallsPending,
    Responded,
    /// Absorbing: an errored session never runs again.
    Error,
}

/// Result of one `step()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The model requested tools; all of them have been resolved.
    ToolCalls { dispatched: usize },
    /// The model replied with text only.
    Responded(String),
}

// ─── SessionServices ────────────────────────────────────────────────────────

/// Everything a session borrows from its environment. Cheap to clone; a
/// parent and its subtasks share one set.
#[derive(Clone)]
pub struct SessionServices {
    pub config: Arc<RuntimeConfig>,
    pub client: Arc<RetryingCompletionClient>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub budget: Arc<ContextBudgetManager>,
    pub estimator: Arc<dyn TokenEstimator>,
    pub system_prompt: Option<Arc<str>>,
    tool_definitions: Arc<Vec<serde_json::Value>>,
}

impl std::fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServices")
            .field("client", &self.client)
            .field("dispatcher", &self.dispatcher)
            .field("tools", &self.tool_definitions.len())
            .finish_non_exhaustive()
    }
}

impl SessionServices {
    pub fn builder(
        config: RuntimeConfig,
        provider: Arc<dyn CompletionProvider>,
        registry: ToolRegistry,
    ) -> SessionServicesBuilder {
        SessionServicesBuilder {
            config,
            provider,
            registry,
            confirmation: None,
            context: None,
            summarizer: None,
            model_summaries: false,
            estimator: None,
            system_prompt: None,
        }
    }

    /// Builder backed by the HTTP provider from `config.provider`.
    pub fn http_builder(
        config: RuntimeConfig,
        registry: ToolRegistry,
    ) -> Result<SessionServicesBuilder, SetupError> {
        let settings = config.provider.clone().ok_or(SetupError::MissingProvider)?;
        let provider = HttpProvider::new(settings)?;
        Ok(Self::builder(config, Arc::new(provider), registry))
    }

    /// OpenAI-format definitions of every registered tool.
    pub fn tool_definitions(&self) -> &[serde_json::Value] {
        &self.tool_definitions
    }
}

pub struct SessionServicesBuilder {
    config: RuntimeConfig,
    provider: Arc<dyn CompletionProvider>,
    registry: ToolRegistry,
    confirmation: Option<Arc<dyn ConfirmationChannel>>,
    context: Option<Arc<RuntimeContext>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    model_summaries: bool,
    estimator: Option<Arc<dyn TokenEstimator>>,
    system_prompt: Option<String>,
}

impl SessionServicesBuilder {
    /// Where require-confirmation decisions are sent. Defaults to [`AutoDeny`].
    pub fn confirmation(mut self, channel: Arc<dyn ConfirmationChannel>) -> Self {
        self.confirmation = Some(channel);
        self
    }

    /// Share an existing context (operation counter, audit, backups).
    /// Defaults to one built from the config.
    pub fn context(mut self, context: Arc<RuntimeContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Let the model condense compacted runs instead of truncating them.
    /// Ignored when an explicit summarizer is set.
    pub fn model_summaries(mut self, enabled: bool) -> Self {
        self.model_summaries = enabled;
        self
    }

    pub fn estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn build(self) -> Result<SessionServices, SetupError> {
        self.config.validate()?;

        let context = match self.context {
            Some(context) => context,
            None => Arc::new(RuntimeContext::from_config(&self.config)?),
        };
        let config = Arc::new(self.config);
        let gate = Arc::new(PermissionGate::new()?);
        let registry = Arc::new(self.registry);
        let tool_definitions = Arc::new(registry.definitions());

        let client = Arc::new(RetryingCompletionClient::new(
            self.provider,
            config.retry.clone(),
            Duration::from_secs(config.limits.llm_timeout_secs),
        ));
        let dispatcher = Arc::new(ToolDispatcher::new(
            registry,
            gate,
            config.clone(),
            context,
            self.confirmation
                .unwrap_or_else(|| Arc::new(AutoDeny) as Arc<dyn ConfirmationChannel>),
        ));
        let summarizer: Arc<dyn Summarizer> = match self.summarizer {
            Some(summarizer) => summarizer,
            None if self.model_summaries => Arc::new(ModelSummarizer::new(client.clone())),
            None => Arc::new(TruncationSummarizer),
        };
        let budget = Arc::new(ContextBudgetManager::new(config.budget.clone(), summarizer));

        tracing::info!(
            tools = tool_definitions.len(),
            context_limit = config.budget.context_limit,
            max_operations = config.limits.max_operations,
            "session services ready"
        );

        Ok(SessionServices {
            config,
            client,
            dispatcher,
            budget,
            estimator: self
                .estimator
                .unwrap_or_else(|| Arc::new(HeuristicEstimator) as Arc<dyn TokenEstimator>),
            system_prompt: self.system_prompt.map(Arc::from),
            tool_definitions,
        })
    }
}

// ─── ConversationSession ────────────────────────────────────────────────────

pub struct ConversationSession {
    id: String,
    parent_id: Option<String>,
    services: SessionServices,
    transcript: TranscriptStore,
    budget: BudgetState,
    state: SessionState,
    grants: PermissionStore,
    usage: UsageCounters,
    cancel: CancellationFlag,
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("state", &self.state)
            .field("transcript", &self.transcript)
            .field("budget", &self.budget)
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

impl ConversationSession {
    /// A new session whose persistent grants live at the configured
    /// permissions file.
    pub fn new(services: SessionServices) -> Self {
        let grants = PermissionStore::open(services.config.permissions_path());
        Self::with_grants(services, grants)
    }

    pub fn with_grants(services: SessionServices, grants: PermissionStore) -> Self {
        let id = Uuid::new_v4().to_string();
        tracing::info!(session_id = %id, "session created");
        Self {
            transcript: TranscriptStore::new(services.estimator.clone()),
            budget: services.budget.initial_state(),
            id,
            parent_id: None,
            services,
            state: SessionState::Idle,
            grants,
            usage: UsageCounters::default(),
            cancel: CancellationFlag::new(),
        }
    }

    /// A child with an empty transcript, sharing services, context and the
    /// cancel flag. Grants are a snapshot of the parent's.
    pub fn spawn_isolated(&self) -> ConversationSession {
        let mut child = Self::with_grants(self.services.clone(), self.grants.clone());
        child.parent_id = Some(self.id.clone());
        child.cancel = self.cancel.clone();
        tracing::info!(session_id = %child.id, parent_id = %self.id, "isolated child session spawned");
        child
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transcript(&self) -> &TranscriptStore {
        &self.transcript
    }

    pub fn budget(&self) -> &BudgetState {
        &self.budget
    }

    pub fn usage(&self) -> &UsageCounters {
        &self.usage
    }

    /// Fold another session's counters into this one.
    pub fn merge_usage(&mut self, other: &UsageCounters) {
        self.usage.merge(other);
    }

    pub fn grants(&self) -> &PermissionStore {
        &self.grants
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    pub fn is_errored(&self) -> bool {
        self.state == SessionState::Error
    }

    // ─── Driving ────────────────────────────────────────────────────────

    /// Submit `prompt` and step until the model replies with text only.
    ///
    /// Hitting `limits.max_steps_per_turn` returns the recoverable
    /// [`SessionError::TurnIncomplete`].
    pub async fn turn(&mut self, prompt: &str) -> Result<String, SessionError> {
        self.ensure_runnable()?;
        self.append(MessageBody::user(prompt))?;

        let max_steps = self.services.config.limits.max_steps_per_turn;
        for _ in 0..max_steps {
            if let StepOutcome::Responded(text) = self.step().await? {
                return Ok(text);
            }
        }

        tracing::warn!(session_id = %self.id, steps = max_steps, "turn incomplete");
        Err(SessionError::TurnIncomplete { steps: max_steps })
    }

    /// One model round-trip plus the tool calls it requests.
    pub async fn step(&mut self) -> Result<StepOutcome, SessionError> {
        self.ensure_runnable()?;

        self.state = SessionState::AwaitingModel;
        self.compact().await?;

        let result = {
            let request = CompletionRequest {
                system_prompt: self.services.system_prompt.as_deref(),
                messages: self.transcript.messages(),
                tools: self.services.tool_definitions(),
            };
            self.services.client.complete(&request).await
        };
        let response = match result {
            Ok(response) => response,
            Err(e) => return Err(self.fail(SessionError::ProviderFatal(e))),
        };
        self.record_usage(&response);

        let calls = normalize_calls(response.tool_calls);
        if calls.is_empty() {
            self.state = SessionState::Responded;
            let text = response.text.unwrap_or_default();
            self.append(MessageBody::assistant(text.clone()))?;
            self.state = SessionState::Idle;
            tracing::debug!(session_id = %self.id, chars = text.len(), "model responded");
            return Ok(StepOutcome::Responded(text));
        }

        self.state = SessionState::ToolCallsPending;
        tracing::info!(
            session_id = %self.id,
            tool_calls = calls.len(),
            tool_names = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "dispatching tool calls"
        );
        self.append(MessageBody::assistant_tool_calls(response.text, calls.clone()))?;

        let mut budget_error = None;
        for (idx, call) in calls.iter().enumerate() {
            let result = match self
                .services
                .dispatcher
                .dispatch(call, &mut self.grants, &self.id)
                .await
            {
                Ok(result) => result,
                Err(e) if e.is_fatal() => {
                    self.close_unexecuted(&calls[idx..], &e.to_string())?;
                    return Err(self.fail(SessionError::ResourceLimitExceeded(e)));
                }
                Err(e) => ToolResult::failure(call, format!("Error: {e}"), 0),
            };
            self.usage.tool_calls += 1;
            self.append(MessageBody::tool(result))?;

            // An ineffective compaction is reported once the batch is whole.
            if budget_error.is_none() {
                match self
                    .services
                    .budget
                    .maybe_compact(&mut self.transcript, &mut self.budget)
                    .await
                {
                    Ok(_) => {}
                    Err(CompactionError::Transcript(e)) => {
                        return Err(self.fail(SessionError::Consistency(e)))
                    }
                    Err(e) => budget_error = Some(e),
                }
            }
        }

        self.state = SessionState::Idle;
        if let Some(e) = budget_error {
            return Err(SessionError::BudgetExceeded(e));
        }
        Ok(StepOutcome::ToolCalls {
            dispatched: calls.len(),
        })
    }

    /// Append a runtime-authored assistant message (subtask results).
    pub fn inject_synthetic(&mut self, text: impl Into<String>) -> Result<usize, SessionError> {
        if self.is_errored() {
            return Err(SessionError::SessionErrored {
                session_id: self.id.clone(),
            });
        }
        let position = self.append(MessageBody::synthetic(text))?;
        self.budget.sync(&self.transcript);
        Ok(position)
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn ensure_runnable(&self) -> Result<(), SessionError> {
        if self.is_errored() {
            return Err(SessionError::SessionErrored {
                session_id: self.id.clone(),
            });
        }
        if self.cancel.is_cancelled() {
            tracing::info!(session_id = %self.id, "cancellation observed");
            return Err(SessionError::Cancelled);
        }
        Ok(())
    }

    async fn compact(&mut self) -> Result<(), SessionError> {
        match self
            .services
            .budget
            .maybe_compact(&mut self.transcript, &mut self.budget)
            .await
        {
            Ok(_) => Ok(()),
            Err(CompactionError::Transcript(e)) => Err(self.fail(SessionError::Consistency(e))),
            Err(e) => {
                self.state = SessionState::Idle;
                Err(SessionError::BudgetExceeded(e))
            }
        }
    }

    fn append(&mut self, body: MessageBody) -> Result<usize, SessionError> {
        match self.transcript.append(body) {
            Ok(position) => {
                self.budget.sync(&self.transcript);
                Ok(position)
            }
            Err(e) => Err(self.fail(SessionError::Consistency(e))),
        }
    }

    /// Answer calls that will never run so the transcript stays paired.
    fn close_unexecuted(
        &mut self,
        calls: &[ToolCallRequest],
        reason: &str,
    ) -> Result<(), SessionError> {
        for call in calls {
            let result = ToolResult::failure(call, format!("Error: not executed: {reason}"), 0);
            self.append(MessageBody::tool(result))?;
        }
        Ok(())
    }

    fn fail(&mut self, error: SessionError) -> SessionError {
        self.state = SessionState::Error;
        tracing::error!(session_id = %self.id, error = %error, "session entered error state");
        error
    }

    fn record_usage(&mut self, response: &ModelResponse) {
        self.usage.llm_calls += 1;
        if let Some(usage) = response.usage {
            self.usage.input_tokens += usage.input_tokens;
            self.usage.output_tokens += usage.output_tokens;
            self.usage.cost_usd += usage.cost_usd;
        }
    }
}

/// Give empty call IDs a fresh one and drop repeats of an ID already seen
/// in the same response.
fn normalize_calls(calls: Vec<ToolCallRequest>) -> Vec<ToolCallRequest> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(calls.len());
    for mut call in calls {
        if call.id.trim().is_empty() {
            call.id = format!("call_{}", Uuid::new_v4().simple());
        }
        if !seen.insert(call.id.clone()) {
            tracing::warn!(call_id = %call.id, tool = %call.name, "duplicate tool call id dropped");
            continue;
        }
        out.push(call);
    }
    out
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::types::Role;
    use crate::inference::ProviderError;
    use crate::test_support::{
        call, call_with, http_error, session, test_config, text_response, tool_call_response,
        EchoTool, Misbehavior, MisbehavingTool, ScriptedProvider,
    };
    use crate::tools::Tool;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn echo_call(id: &str, text: &str) -> ToolCallRequest {
        call_with(id, "echo", json!({ "text": text }))
    }

    #[tokio::test]
    async fn test_text_only_turn() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_response("hello"))]));
        let mut s = session(test_config(dir.path()), provider.clone(), vec![]);

        assert_eq!(s.turn("hi").await.unwrap(), "hello");
        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(s.transcript().len(), 2);
        assert_eq!(s.transcript().messages()[1].role(), Role::Assistant);
        assert_eq!(s.usage().llm_calls, 1);
        assert_eq!(s.usage().input_tokens, 100);
        assert_eq!(s.budget().cumulative_tokens, s.transcript().total_tokens());
    }

    #[tokio::test]
    async fn test_tool_calls_dispatched_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let echo = EchoTool::new("echo");
        let counter = echo.counter();
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response(vec![echo_call("c1", "first"), echo_call("c2", "second")])),
            Ok(text_response("done")),
        ]));
        let mut s = session(test_config(dir.path()), provider.clone(), vec![Arc::new(echo)]);

        assert_eq!(s.turn("go").await.unwrap(), "done");
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        let msgs = s.transcript().messages();
        assert_eq!(msgs.len(), 5);
        let r1 = msgs[2].tool_result().unwrap();
        let r2 = msgs[3].tool_result().unwrap();
        assert_eq!((r1.call_id.as_str(), r1.model_text().as_str()), ("c1", "first"));
        assert_eq!((r2.call_id.as_str(), r2.model_text().as_str()), ("c2", "second"));
        assert_eq!(provider.seen_lengths(), vec![1, 4]);
        assert_eq!(s.usage().llm_calls, 2);
        assert_eq!(s.usage().tool_calls, 2);
    }

    #[tokio::test]
    async fn test_single_step_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(tool_call_response(vec![
            echo_call("c1", "x"),
        ]))]));
        let mut s = session(
            test_config(dir.path()),
            provider,
            vec![Arc::new(EchoTool::new("echo"))],
        );
        s.inject_synthetic("context").unwrap();

        let outcome = s.step().await.unwrap();
        assert_eq!(outcome, StepOutcome::ToolCalls { dispatched: 1 });
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!s.transcript().has_open_calls());
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_failure_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![Err(http_error(401))]));
        let mut s = session(test_config(dir.path()), provider.clone(), vec![]);

        let err = s.turn("hi").await.unwrap_err();
        assert!(matches!(err, SessionError::ProviderFatal(ref e) if e.is_auth_failure()));
        assert!(!err.is_recoverable());
        assert_eq!(s.state(), SessionState::Error);

        let again = s.turn("retry").await.unwrap_err();
        assert!(matches!(again, SessionError::SessionErrored { .. }));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(http_error(503)),
            Err(http_error(503)),
            Err(http_error(503)),
            Err(http_error(503)),
        ]));
        let mut s = session(test_config(dir.path()), provider.clone(), vec![]);

        let err = s.turn("hi").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::ProviderFatal(ProviderError::Unavailable { attempts: 4, .. })
        ));
        assert_eq!(provider.calls(), 4);
        assert!(s.is_errored());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported_to_model() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response(vec![call("c1", "does_not_exist")])),
            Ok(text_response("sorry")),
        ]));
        let mut s = session(test_config(dir.path()), provider, vec![]);

        assert_eq!(s.turn("go").await.unwrap(), "sorry");
        let result = s.transcript().messages()[2].tool_result().unwrap();
        assert!(!result.success);
        assert!(result.model_text().contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_tool_panic_does_not_crash_session() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response(vec![call("c1", "boom")])),
            Ok(text_response("recovered")),
        ]));
        let tool: Arc<dyn Tool> = Arc::new(MisbehavingTool::new("boom", Misbehavior::Panic));
        let mut s = session(test_config(dir.path()), provider, vec![tool]);

        assert_eq!(s.turn("go").await.unwrap(), "recovered");
        let result = s.transcript().messages()[2].tool_result().unwrap();
        assert!(!result.success);
        assert!(result.model_text().contains("panicked"));
    }

    #[tokio::test]
    async fn test_turn_incomplete_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.limits.max_steps_per_turn = 2;
        let provider = Arc::new(
            ScriptedProvider::new(vec![])
                .with_fallback(tool_call_response(vec![echo_call("c1", "again")])),
        );
        let mut s = session(config, provider.clone(), vec![Arc::new(EchoTool::new("echo"))]);

        let err = s.turn("loop").await.unwrap_err();
        assert!(matches!(err, SessionError::TurnIncomplete { steps: 2 }));
        assert!(err.is_recoverable());
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!s.transcript().has_open_calls());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_operation_limit_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.limits.max_operations = 1;
        let echo = EchoTool::new("echo");
        let counter = echo.counter();
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(tool_call_response(vec![
            echo_call("c1", "a"),
            echo_call("c2", "b"),
            echo_call("c3", "c"),
        ]))]));
        let mut s = session(config, provider, vec![Arc::new(echo)]);

        let err = s.turn("go").await.unwrap_err();
        assert!(matches!(err, SessionError::ResourceLimitExceeded(_)));
        assert!(err.to_string().contains("max_operations"));
        assert_eq!(s.state(), SessionState::Error);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // Unexecuted calls are still answered.
        assert!(!s.transcript().has_open_calls());
        assert_eq!(s.transcript().len(), 5);
    }

    #[tokio::test]
    async fn test_cancellation_observed_between_steps() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_response("never"))]));
        let mut s = session(test_config(dir.path()), provider.clone(), vec![]);

        s.cancellation().cancel();
        assert!(matches!(s.turn("hi").await, Err(SessionError::Cancelled)));
        assert_eq!(provider.calls(), 0);
        assert!(s.transcript().is_empty());

        s.cancellation().reset();
        assert_eq!(s.turn("hi").await.unwrap(), "never");
    }

    #[tokio::test]
    async fn test_call_ids_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let echo = EchoTool::new("echo");
        let counter = echo.counter();
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response(vec![
                echo_call("c1", "a"),
                echo_call("c1", "dup"),
                echo_call("", "anon"),
            ])),
            Ok(text_response("ok")),
        ]));
        let mut s = session(test_config(dir.path()), provider, vec![Arc::new(echo)]);

        s.turn("go").await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        let requested = s.transcript().messages()[1].tool_calls();
        assert_eq!(requested.len(), 2);
        assert_eq!(requested[0].id, "c1");
        assert!(requested[1].id.starts_with("call_"));
    }

    #[tokio::test]
    async fn test_budget_exceeded_before_model_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.budget.context_limit = 100;
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_response("unused"))]));
        let mut s = session(config, provider.clone(), vec![]);

        let err = s.turn(&"word ".repeat(200)).await.unwrap_err();
        assert!(matches!(err, SessionError::BudgetExceeded(_)));
        assert!(err.is_recoverable());
        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_compaction_between_tool_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.budget.context_limit = 1_000;
        config.budget.prune_protect = 100;
        config.budget.prune_minimum = 50;
        let flood: Arc<dyn Tool> = Arc::new(MisbehavingTool::new("flood", Misbehavior::Flood(600)));
        let mut script: Vec<Result<ModelResponse, ProviderError>> = ["c1", "c2", "c3", "c4"]
            .iter()
            .map(|id| Ok(tool_call_response(vec![call(id, "flood")])))
            .collect();
        script.push(Ok(text_response("done")));
        let provider = Arc::new(ScriptedProvider::new(script));
        let mut s = session(config, provider, vec![flood]);

        assert_eq!(s.turn("go").await.unwrap(), "done");
        assert!(s.transcript().messages().iter().any(|m| m.is_synthetic()));
        assert!(s.budget().cumulative_tokens < 750);
        assert_eq!(s.budget().cumulative_tokens, s.transcript().total_tokens());
        assert_eq!(s.transcript().last_assistant_text(), Some("done"));
    }

    #[tokio::test]
    async fn test_spawn_isolated_shares_context_not_history() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_response("parent"))]));
        let mut parent = session(test_config(dir.path()), provider, vec![]);
        parent.turn("hi").await.unwrap();

        let child = parent.spawn_isolated();
        assert!(child.transcript().is_empty());
        assert_eq!(child.parent_id(), Some(parent.id()));
        assert_ne!(child.id(), parent.id());
        assert!(Arc::ptr_eq(&child.services().dispatcher, &parent.services().dispatcher));

        parent.cancellation().cancel();
        assert!(child.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.budget.compaction_threshold = 1.5;
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let result = SessionServices::builder(config, provider, ToolRegistry::new()).build();
        assert!(matches!(result, Err(SetupError::Config(_))));
    }

    #[test]
    fn test_http_builder_requires_provider() {
        let dir = tempfile::tempdir().unwrap();
        let result = SessionServices::http_builder(test_config(dir.path()), ToolRegistry::new());
        assert!(matches!(result, Err(SetupError::MissingProvider)));
    }
}

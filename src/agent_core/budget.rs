//! ContextBudgetManager: keeps the transcript under its compaction threshold.
//!
//! Responsibilities:
//! - Track cumulative transcript tokens against the hard limit
//! - Group the transcript into complete tool exchanges
//! - Protect the newest `prune_protect` tokens of tool output
//! - Replace older runs of exchanges with one synthetic summary each
//! - Report compaction that cannot reach the threshold instead of looping
//!
//! Summaries come from a pluggable [`Summarizer`]. The default is a
//! deterministic truncation; [`ModelSummarizer`] asks the model and falls
//! back to truncation.

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;

use super::errors::CompactionError;
use super::tokens::{self, summarize_tool_result, summarize_turn};
use super::transcript::TranscriptStore;
use super::types::{Message, MessageBody, Role};
use crate::config::BudgetConfig;
use crate::inference::{CompletionRequest, RetryingCompletionClient};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Maximum lines in a truncation summary before the rest are counted only.
const MAX_SUMMARY_LINES: usize = 24;

/// Maximum tokens for a single summary message.
const MAX_SUMMARY_TOKENS: u32 = 500;

/// Instruction sent with a model-generated condensation request.
const CONDENSE_PROMPT: &str = "Condense the following agent tool activity into a short factual \
summary. Keep file paths, commands, key results and errors. Reply with the summary only.";

// ─── BudgetState ────────────────────────────────────────────────────────────

/// Token accounting for one session's transcript.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetState {
    pub cumulative_tokens: u64,
    pub hard_limit: u64,
    /// Fraction of `hard_limit` at which compaction starts.
    pub compaction_threshold: f64,
}

impl BudgetState {
    pub fn new(hard_limit: u64, compaction_threshold: f64) -> Self {
        Self {
            cumulative_tokens: 0,
            hard_limit,
            compaction_threshold,
        }
    }

    pub fn from_config(config: &BudgetConfig) -> Self {
        Self::new(config.context_limit, config.compaction_threshold)
    }

    /// Smallest token count at which compaction is needed.
    pub fn threshold_tokens(&self) -> u64 {
        (self.hard_limit as f64 * self.compaction_threshold).ceil() as u64
    }

    pub fn usage_fraction(&self) -> f64 {
        if self.hard_limit == 0 {
            return 1.0;
        }
        self.cumulative_tokens as f64 / self.hard_limit as f64
    }

    pub fn needs_compaction(&self) -> bool {
        self.cumulative_tokens >= self.threshold_tokens()
    }

    /// Re-read the cumulative total from the transcript.
    pub fn sync(&mut self, transcript: &TranscriptStore) {
        self.cumulative_tokens = transcript.total_tokens();
    }
}

// ─── Summarizer ─────────────────────────────────────────────────────────────

/// Produces the text of a compaction summary for a run of messages.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> String;
}

/// Deterministic summary: one line per message, capped in lines and tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct TruncationSummarizer;

impl TruncationSummarizer {
    pub fn render(messages: &[Message]) -> String {
        let mut lines = Vec::new();
        let mut files: Vec<&str> = Vec::new();

        for msg in messages {
            for call in msg.tool_calls() {
                if let Some(path) = call.arguments.get("path").and_then(|v| v.as_str()) {
                    if !files.contains(&path) {
                        files.push(path);
                    }
                }
                lines.push(format!(
                    "Assistant called {}({})",
                    call.name,
                    tokens::truncate_utf8(&call.arguments.to_string(), 60)
                ));
            }
            match msg.tool_result() {
                Some(result) => lines.push(summarize_tool_result(
                    &result.tool_name,
                    result.success,
                    &result.model_text(),
                )),
                None if msg.tool_calls().is_empty() || msg.text().is_some() => {
                    lines.push(summarize_turn(msg.role(), msg.text()));
                }
                None => {}
            }
        }

        let total = lines.len();
        let mut out = format!("[Compacted {} earlier messages]", messages.len());
        if !files.is_empty() {
            out.push_str(&format!("\nFiles touched: {}", files.join(", ")));
        }
        for line in lines.iter().take(MAX_SUMMARY_LINES) {
            out.push('\n');
            out.push_str(line);
        }
        if total > MAX_SUMMARY_LINES {
            out.push_str(&format!("\n... and {} more", total - MAX_SUMMARY_LINES));
        }

        if tokens::estimate_tokens(&out) > MAX_SUMMARY_TOKENS {
            let target_chars = (f64::from(MAX_SUMMARY_TOKENS) * 3.2) as usize;
            out = format!("{}\n[summary truncated]", tokens::truncate_utf8(&out, target_chars));
        }
        out
    }
}

#[async_trait]
impl Summarizer for TruncationSummarizer {
    async fn summarize(&self, messages: &[Message]) -> String {
        Self::render(messages)
    }
}

/// Asks the model for a condensation; falls back to truncation when the
/// call fails or the reply is not smaller than the run.
pub struct ModelSummarizer {
    client: Arc<RetryingCompletionClient>,
}

impl ModelSummarizer {
    pub fn new(client: Arc<RetryingCompletionClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    async fn summarize(&self, messages: &[Message]) -> String {
        let rendered = TruncationSummarizer::render(messages);
        let prompt = Message {
            ordinal: 0,
            timestamp: chrono::Utc::now().to_rfc3339(),
            token_count: 0,
            body: MessageBody::user(rendered.clone()),
        };
        let request = CompletionRequest {
            system_prompt: Some(CONDENSE_PROMPT),
            messages: std::slice::from_ref(&prompt),
            tools: &[],
        };

        let run_tokens: u64 = messages.iter().map(|m| u64::from(m.token_count)).sum();
        match self.client.complete(&request).await {
            Ok(resp) => match resp.text.filter(|t| !t.trim().is_empty()) {
                Some(text) if u64::from(tokens::estimate_tokens(&text)) < run_tokens => {
                    format!("[Compacted {} earlier messages]\n{text}", messages.len())
                }
                _ => rendered,
            },
            Err(e) => {
                tracing::warn!(error = %e, "model summarization failed, using truncation");
                rendered
            }
        }
    }
}

// ─── ContextBudgetManager ───────────────────────────────────────────────────

/// What a `maybe_compact` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// Under threshold, or compaction disabled.
    NotNeeded,
    Compacted {
        runs: usize,
        messages_removed: usize,
        tokens_freed: u64,
    },
}

/// A complete tool exchange: one assistant request and all its results.
#[derive(Debug, Clone)]
struct Exchange {
    range: Range<usize>,
    weight: u64,
    tool_output_tokens: u64,
}

pub struct ContextBudgetManager {
    config: BudgetConfig,
    summarizer: Arc<dyn Summarizer>,
}

impl std::fmt::Debug for ContextBudgetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBudgetManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ContextBudgetManager {
    pub fn new(config: BudgetConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { config, summarizer }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// A fresh budget state for a session governed by this manager.
    pub fn initial_state(&self) -> BudgetState {
        BudgetState::from_config(&self.config)
    }

    /// Compact the transcript if usage has reached the threshold.
    ///
    /// Runs oldest first and stops as soon as usage drops below the
    /// threshold. Fails with [`CompactionError::Ineffective`] when every
    /// eligible run has been compacted and usage is still too high; a second
    /// call with no new messages then changes nothing.
    pub async fn maybe_compact(
        &self,
        transcript: &mut TranscriptStore,
        state: &mut BudgetState,
    ) -> Result<CompactionOutcome, CompactionError> {
        state.sync(transcript);
        if !self.config.auto_compact || !state.needs_compaction() {
            return Ok(CompactionOutcome::NotNeeded);
        }

        let before = state.cumulative_tokens;
        let runs = self.eligible_runs(transcript);
        let mut shift = 0usize;
        let mut compacted = 0usize;
        let mut messages_removed = 0usize;

        for run in runs {
            let range = (run.start - shift)..(run.end - shift);
            let len = range.len();
            let weight: u64 = transcript
                .slice(range.clone())
                .iter()
                .map(|m| u64::from(m.token_count))
                .sum();

            let summary = self.summarizer.summarize(transcript.slice(range.clone())).await;
            let mut body = MessageBody::synthetic(summary);
            if u64::from(transcript.estimate(&body)) >= weight {
                body = MessageBody::synthetic(format!("[Compacted {len} earlier messages]"));
            }
            transcript.replace_range(range, body)?;

            shift += len - 1;
            compacted += 1;
            messages_removed += len - 1;
            state.sync(transcript);
            if !state.needs_compaction() {
                break;
            }
        }

        if state.needs_compaction() {
            tracing::warn!(
                before,
                after = state.cumulative_tokens,
                threshold = state.threshold_tokens(),
                runs = compacted,
                "compaction could not reach threshold"
            );
            return Err(CompactionError::Ineffective {
                before,
                after: state.cumulative_tokens,
                threshold_tokens: state.threshold_tokens(),
                hard_limit: state.hard_limit,
            });
        }

        tracing::info!(
            before,
            after = state.cumulative_tokens,
            runs = compacted,
            messages_removed,
            "transcript compacted"
        );
        Ok(CompactionOutcome::Compacted {
            runs: compacted,
            messages_removed,
            tokens_freed: before.saturating_sub(state.cumulative_tokens),
        })
    }

    /// Ranges of adjacent unprotected exchanges heavier than `prune_minimum`,
    /// oldest first.
    fn eligible_runs(&self, transcript: &TranscriptStore) -> Vec<Range<usize>> {
        let mut exchanges = complete_exchanges(transcript);

        // Newest exchanges keep their detail until `prune_protect` tokens of
        // tool output are covered.
        let mut protected_tokens = 0u64;
        let mut first_unprotected = exchanges.len();
        for (i, ex) in exchanges.iter().enumerate().rev() {
            if protected_tokens >= self.config.prune_protect {
                break;
            }
            protected_tokens += ex.tool_output_tokens;
            first_unprotected = i;
        }
        exchanges.truncate(first_unprotected);

        let mut runs: Vec<(Range<usize>, u64)> = Vec::new();
        for ex in exchanges {
            match runs.last_mut() {
                Some((range, weight)) if range.end == ex.range.start => {
                    range.end = ex.range.end;
                    *weight += ex.weight;
                }
                _ => runs.push((ex.range, ex.weight)),
            }
        }

        runs.into_iter()
            .filter(|(range, weight)| range.len() > 1 && *weight > self.config.prune_minimum)
            .map(|(range, _)| range)
            .collect()
    }
}

/// Every assistant request whose results all follow it, oldest first.
/// A request with open calls is never an exchange.
fn complete_exchanges(transcript: &TranscriptStore) -> Vec<Exchange> {
    let messages = transcript.messages();
    let mut out = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let msg = &messages[i];
        if msg.role() != Role::Assistant || msg.tool_calls().is_empty() {
            i += 1;
            continue;
        }
        let expected = msg.tool_calls().len();
        let mut end = i + 1;
        let mut tool_output_tokens = 0u64;
        while end < messages.len() && messages[end].role() == Role::Tool {
            tool_output_tokens += u64::from(messages[end].token_count);
            end += 1;
        }
        if end - i - 1 == expected {
            let weight = messages[i..end].iter().map(|m| u64::from(m.token_count)).sum();
            out.push(Exchange {
                range: i..end,
                weight,
                tool_output_tokens,
            });
        }
        i = end;
    }
    out
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::tokens::HeuristicEstimator;
    use crate::test_support::{call, ok_result};

    fn budget(protect: u64, minimum: u64) -> BudgetConfig {
        BudgetConfig {
            context_limit: 1_000,
            compaction_threshold: 0.75,
            prune_protect: protect,
            prune_minimum: minimum,
            auto_compact: true,
        }
    }

    fn manager(config: BudgetConfig) -> ContextBudgetManager {
        ContextBudgetManager::new(config, Arc::new(TruncationSummarizer))
    }

    fn store() -> TranscriptStore {
        TranscriptStore::new(Arc::new(HeuristicEstimator))
    }

    fn exchange(t: &mut TranscriptStore, id: &str, chars: usize) {
        t.append(MessageBody::assistant_tool_calls(None, vec![call(id, "read")]))
            .unwrap();
        t.append(MessageBody::tool(ok_result(id, "read", &"x".repeat(chars))))
            .unwrap();
    }

    /// User prompt plus four ~240-token exchanges: about 960 tokens.
    fn heavy_transcript() -> TranscriptStore {
        let mut t = store();
        t.append(MessageBody::user("start")).unwrap();
        for id in ["c1", "c2", "c3", "c4"] {
            exchange(&mut t, id, 600);
        }
        t
    }

    fn snapshot(t: &TranscriptStore) -> Vec<(u64, u32)> {
        t.messages().iter().map(|m| (m.ordinal, m.token_count)).collect()
    }

    #[test]
    fn test_budget_state_threshold() {
        let mut state = BudgetState::new(1_000, 0.75);
        assert_eq!(state.threshold_tokens(), 750);
        state.cumulative_tokens = 749;
        assert!(!state.needs_compaction());
        state.cumulative_tokens = 750;
        assert!(state.needs_compaction());
        assert!((state.usage_fraction() - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_noop_below_threshold() {
        let mut t = store();
        exchange(&mut t, "c1", 100);
        let mut state = BudgetState::new(1_000, 0.75);
        let before = snapshot(&t);

        let outcome = manager(budget(0, 0)).maybe_compact(&mut t, &mut state).await.unwrap();
        assert_eq!(outcome, CompactionOutcome::NotNeeded);
        assert_eq!(snapshot(&t), before);
        assert_eq!(state.cumulative_tokens, t.total_tokens());
    }

    #[tokio::test]
    async fn test_compacts_below_threshold() {
        let mut t = heavy_transcript();
        let mut state = BudgetState::new(1_000, 0.75);
        state.sync(&t);
        assert!(state.cumulative_tokens > 800);

        let outcome = manager(budget(100, 50)).maybe_compact(&mut t, &mut state).await.unwrap();
        assert!(matches!(outcome, CompactionOutcome::Compacted { runs: 1, messages_removed: 5, .. }));
        assert!(state.cumulative_tokens < 750);

        // user, summary, newest exchange
        assert_eq!(t.len(), 4);
        assert_eq!(t.messages()[0].role(), Role::User);
        assert!(t.messages()[1].is_synthetic());
        assert!(t.messages()[1].text().unwrap().starts_with("[Compacted 6 earlier messages]"));
        assert_eq!(t.messages()[3].tool_result().unwrap().call_id, "c4");

        // The summary takes the first replaced ordinal; survivors keep theirs.
        let ordinals: Vec<u64> = t.messages().iter().map(|m| m.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 7, 8]);
    }

    #[tokio::test]
    async fn test_compaction_is_idempotent() {
        let mut t = heavy_transcript();
        let mut state = BudgetState::new(1_000, 0.75);
        let mgr = manager(budget(100, 50));

        mgr.maybe_compact(&mut t, &mut state).await.unwrap();
        let after_first = snapshot(&t);
        let state_first = state;

        let outcome = mgr.maybe_compact(&mut t, &mut state).await.unwrap();
        assert_eq!(outcome, CompactionOutcome::NotNeeded);
        assert_eq!(snapshot(&t), after_first);
        assert_eq!(state, state_first);
    }

    #[tokio::test]
    async fn test_additivity_after_compaction() {
        let mut t = heavy_transcript();
        let mut state = BudgetState::new(1_000, 0.75);
        manager(budget(100, 50)).maybe_compact(&mut t, &mut state).await.unwrap();

        let estimator = HeuristicEstimator;
        let sum: u64 = t
            .messages()
            .iter()
            .map(|m| u64::from(crate::agent_core::tokens::TokenEstimator::estimate(&estimator, &m.body)))
            .sum();
        assert_eq!(state.cumulative_tokens, sum);
        assert_eq!(t.total_tokens(), sum);
    }

    #[tokio::test]
    async fn test_protected_exchanges_survive() {
        let mut t = heavy_transcript();
        let mut state = BudgetState::new(1_000, 0.75);
        // Protect everything: nothing may be compacted.
        let err = manager(budget(100_000, 0))
            .maybe_compact(&mut t, &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, CompactionError::Ineffective { threshold_tokens: 750, hard_limit: 1_000, .. }));
        assert_eq!(t.len(), 9);
    }

    #[tokio::test]
    async fn test_open_calls_never_compacted() {
        let mut t = heavy_transcript();
        t.append(MessageBody::assistant_tool_calls(None, vec![call("open", "read")]))
            .unwrap();
        let mut state = BudgetState::new(1_000, 0.75);

        // No protection at all: every complete exchange is eligible.
        manager(budget(0, 0)).maybe_compact(&mut t, &mut state).await.unwrap();
        assert_eq!(t.open_call_ids(), ["open".to_string()]);
        let last = t.messages().last().unwrap();
        assert_eq!(last.tool_calls()[0].id, "open");
        t.append(MessageBody::tool(ok_result("open", "read", "late"))).unwrap();
    }

    #[tokio::test]
    async fn test_ineffective_is_reported_and_stable() {
        let mut t = store();
        for _ in 0..3 {
            t.append(MessageBody::user("y".repeat(1_000))).unwrap();
        }
        let mut state = BudgetState::new(1_000, 0.75);
        let mgr = manager(budget(0, 0));
        let before = snapshot(&t);

        let first = mgr.maybe_compact(&mut t, &mut state).await.unwrap_err();
        let second = mgr.maybe_compact(&mut t, &mut state).await.unwrap_err();
        assert_eq!(first, second);
        assert_eq!(snapshot(&t), before);
    }

    #[tokio::test]
    async fn test_light_runs_are_left_alone() {
        let mut t = heavy_transcript();
        let mut state = BudgetState::new(1_000, 0.75);
        let err = manager(budget(100, 10_000))
            .maybe_compact(&mut t, &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, CompactionError::Ineffective { .. }));
        assert_eq!(t.len(), 9);
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let mut t = heavy_transcript();
        let mut state = BudgetState::new(1_000, 0.75);
        let mut config = budget(0, 0);
        config.auto_compact = false;
        let outcome = manager(config).maybe_compact(&mut t, &mut state).await.unwrap();
        assert_eq!(outcome, CompactionOutcome::NotNeeded);
        assert_eq!(t.len(), 9);
    }

    #[test]
    fn test_truncation_summary_lists_files() {
        let mut t = store();
        t.append(MessageBody::assistant_tool_calls(
            None,
            vec![crate::test_support::call_with(
                "c1",
                "read_file",
                serde_json::json!({"path": "src/main.rs"}),
            )],
        ))
        .unwrap();
        t.append(MessageBody::tool(ok_result("c1", "read_file", "fn main() {}")))
            .unwrap();

        let summary = TruncationSummarizer::render(t.messages());
        assert!(summary.contains("Files touched: src/main.rs"));
        assert!(summary.contains("Assistant called read_file"));
        assert!(summary.contains("[read_file returned: fn main() {}]"));
    }
}

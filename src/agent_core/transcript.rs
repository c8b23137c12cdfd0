//! Transcript store: the ordered message history of one session.
//!
//! Responsibilities:
//! - Stamp appended messages with an ordinal, timestamp and token estimate
//! - Enforce tool-call pairing: every tool message answers exactly one open
//!   call, and no other message may be appended while calls are open
//! - Maintain the cumulative token total incrementally
//! - Support the range operations compaction needs without breaking pairing

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

use super::errors::TranscriptError;
use super::tokens::TokenEstimator;
use super::types::{Message, MessageBody, Role};

// ─── TranscriptStore ────────────────────────────────────────────────────────

/// Owned by exactly one session; never shared across sessions.
pub struct TranscriptStore {
    messages: Vec<Message>,
    next_ordinal: u64,
    /// Call IDs requested by the latest assistant message and not yet answered.
    open_calls: Vec<String>,
    total_tokens: u64,
    estimator: Arc<dyn TokenEstimator>,
}

impl std::fmt::Debug for TranscriptStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptStore")
            .field("messages", &self.messages.len())
            .field("open_calls", &self.open_calls)
            .field("total_tokens", &self.total_tokens)
            .finish()
    }
}

impl TranscriptStore {
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            messages: Vec::new(),
            next_ordinal: 0,
            open_calls: Vec::new(),
            total_tokens: 0,
            estimator,
        }
    }

    /// Append a message, returning its position.
    pub fn append(&mut self, body: MessageBody) -> Result<usize, TranscriptError> {
        match body.role {
            Role::Tool => {
                let result = body
                    .tool_result
                    .as_ref()
                    .ok_or(TranscriptError::MissingToolResult)?;
                let idx = self
                    .open_calls
                    .iter()
                    .position(|id| *id == result.call_id)
                    .ok_or_else(|| TranscriptError::OrphanToolResult {
                        call_id: result.call_id.clone(),
                    })?;
                self.open_calls.remove(idx);
            }
            Role::User | Role::Assistant => {
                if !self.open_calls.is_empty() {
                    return Err(TranscriptError::UnresolvedToolCalls {
                        call_ids: self.open_calls.clone(),
                    });
                }
                let mut seen = HashSet::new();
                for call in &body.tool_calls {
                    if !seen.insert(call.id.as_str()) {
                        return Err(TranscriptError::DuplicateCallId {
                            call_id: call.id.clone(),
                        });
                    }
                }
                self.open_calls = body.tool_calls.iter().map(|c| c.id.clone()).collect();
            }
        }

        let message = self.stamp(body);
        self.total_tokens += u64::from(message.token_count);
        self.messages.push(message);
        Ok(self.messages.len() - 1)
    }

    /// Messages in `range`, clamped to the transcript bounds.
    pub fn slice(&self, range: Range<usize>) -> &[Message] {
        let end = range.end.min(self.messages.len());
        let start = range.start.min(end);
        &self.messages[start..end]
    }

    /// Drop every message before `position`.
    ///
    /// Refused when `position` would separate tool results from their request.
    pub fn truncate_before(&mut self, position: usize) -> Result<(), TranscriptError> {
        if position > self.messages.len() {
            return Err(TranscriptError::InvalidRange {
                start: 0,
                end: position,
                reason: format!("transcript has {} messages", self.messages.len()),
            });
        }
        if self
            .messages
            .get(position)
            .is_some_and(|m| m.role() == Role::Tool)
        {
            return Err(TranscriptError::InvalidRange {
                start: 0,
                end: position,
                reason: "would orphan tool results".into(),
            });
        }
        if self.has_open_calls()
            && self.messages[..position]
                .iter()
                .any(|m| m.tool_calls().iter().any(|c| self.open_calls.contains(&c.id)))
        {
            return Err(TranscriptError::InvalidRange {
                start: 0,
                end: position,
                reason: "would drop a request that still awaits results".into(),
            });
        }
        let removed: u64 = self.messages[..position]
            .iter()
            .map(|m| u64::from(m.token_count))
            .sum();
        self.messages.drain(..position);
        self.total_tokens -= removed;
        Ok(())
    }

    /// Replace `range` with a single synthetic message. Returns the tokens freed.
    ///
    /// The replacement takes the first ordinal of the range, so ordinals keep
    /// increasing with position.
    ///
    /// The range must hold complete tool exchanges: every call requested inside
    /// it is answered inside it and every result inside it answers a request
    /// inside it. Open calls can never be replaced.
    pub fn replace_range(
        &mut self,
        range: Range<usize>,
        replacement: MessageBody,
    ) -> Result<u64, TranscriptError> {
        let Range { start, end } = range;
        if start >= end || end > self.messages.len() {
            return Err(TranscriptError::InvalidRange {
                start,
                end,
                reason: format!("transcript has {} messages", self.messages.len()),
            });
        }
        if !replacement.tool_calls.is_empty() || replacement.role == Role::Tool {
            return Err(TranscriptError::InvalidRange {
                start,
                end,
                reason: "replacement must not carry tool calls or results".into(),
            });
        }

        let mut requested = HashSet::new();
        let mut answered = HashSet::new();
        for m in &self.messages[start..end] {
            requested.extend(m.tool_calls().iter().map(|c| c.id.as_str()));
            if let Some(r) = m.tool_result() {
                answered.insert(r.call_id.as_str());
            }
        }
        if requested != answered || self.open_calls.iter().any(|id| requested.contains(id.as_str())) {
            return Err(TranscriptError::InvalidRange {
                start,
                end,
                reason: "range splits a tool exchange".into(),
            });
        }

        let message = self.stamp_as(self.messages[start].ordinal, replacement);
        let removed: u64 = self.messages[start..end]
            .iter()
            .map(|m| u64::from(m.token_count))
            .sum();
        let added = u64::from(message.token_count);
        self.messages.splice(start..end, std::iter::once(message));
        self.total_tokens = self.total_tokens - removed + added;
        Ok(removed.saturating_sub(added))
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Sum of every message's token estimate.
    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    /// Call IDs still awaiting a result.
    pub fn open_call_ids(&self) -> &[String] {
        &self.open_calls
    }

    pub fn has_open_calls(&self) -> bool {
        !self.open_calls.is_empty()
    }

    /// Text of the most recent assistant message that has any.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role() == Role::Assistant)
            .find_map(|m| m.text())
    }

    pub fn estimator(&self) -> &Arc<dyn TokenEstimator> {
        &self.estimator
    }

    /// Estimate a body without appending it.
    pub fn estimate(&self, body: &MessageBody) -> u32 {
        self.estimator.estimate(body)
    }

    fn stamp(&mut self, body: MessageBody) -> Message {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.stamp_as(ordinal, body)
    }

    fn stamp_as(&self, ordinal: u64, body: MessageBody) -> Message {
        Message {
            ordinal,
            timestamp: chrono::Utc::now().to_rfc3339(),
            token_count: self.estimator.estimate(&body),
            body,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::tokens::HeuristicEstimator;
    use crate::test_support::{call, ok_result};

    fn store() -> TranscriptStore {
        TranscriptStore::new(Arc::new(HeuristicEstimator))
    }

    fn sum_of_estimates(t: &TranscriptStore) -> u64 {
        t.messages()
            .iter()
            .map(|m| u64::from(HeuristicEstimator.estimate(&m.body)))
            .sum()
    }

    #[test]
    fn test_append_assigns_positions_and_ordinals() {
        let mut t = store();
        assert_eq!(t.append(MessageBody::user("hi")).unwrap(), 0);
        assert_eq!(t.append(MessageBody::assistant("hello")).unwrap(), 1);
        assert_eq!(t.messages()[0].ordinal, 0);
        assert_eq!(t.messages()[1].ordinal, 1);
    }

    #[test]
    fn test_tool_result_must_answer_open_call() {
        let mut t = store();
        t.append(MessageBody::user("go")).unwrap();
        let err = t.append(MessageBody::tool(ok_result("c1", "echo", "x"))).unwrap_err();
        assert_eq!(err, TranscriptError::OrphanToolResult { call_id: "c1".into() });
    }

    #[test]
    fn test_results_may_arrive_in_any_order() {
        let mut t = store();
        t.append(MessageBody::assistant_tool_calls(
            None,
            vec![call("a", "echo"), call("b", "echo")],
        ))
        .unwrap();
        t.append(MessageBody::tool(ok_result("b", "echo", "2"))).unwrap();
        assert_eq!(t.open_call_ids(), ["a".to_string()]);
        t.append(MessageBody::tool(ok_result("a", "echo", "1"))).unwrap();
        assert!(!t.has_open_calls());
    }

    #[test]
    fn test_duplicate_result_rejected() {
        let mut t = store();
        t.append(MessageBody::assistant_tool_calls(None, vec![call("a", "echo")]))
            .unwrap();
        t.append(MessageBody::tool(ok_result("a", "echo", "1"))).unwrap();
        assert!(t.append(MessageBody::tool(ok_result("a", "echo", "1"))).is_err());
    }

    #[test]
    fn test_no_message_while_calls_open() {
        let mut t = store();
        t.append(MessageBody::assistant_tool_calls(None, vec![call("a", "echo")]))
            .unwrap();
        let err = t.append(MessageBody::user("next")).unwrap_err();
        assert!(matches!(err, TranscriptError::UnresolvedToolCalls { .. }));
    }

    #[test]
    fn test_duplicate_call_ids_rejected() {
        let mut t = store();
        let err = t
            .append(MessageBody::assistant_tool_calls(
                None,
                vec![call("a", "echo"), call("a", "echo")],
            ))
            .unwrap_err();
        assert_eq!(err, TranscriptError::DuplicateCallId { call_id: "a".into() });
        assert!(t.is_empty());
    }

    #[test]
    fn test_total_is_sum_of_estimates() {
        let mut t = store();
        t.append(MessageBody::user("read the file")).unwrap();
        t.append(MessageBody::assistant_tool_calls(
            Some("reading".into()),
            vec![call("a", "echo")],
        ))
        .unwrap();
        t.append(MessageBody::tool(ok_result("a", "echo", &"z".repeat(500))))
            .unwrap();
        t.append(MessageBody::assistant("done")).unwrap();
        assert_eq!(t.total_tokens(), sum_of_estimates(&t));

        t.replace_range(1..3, MessageBody::synthetic("summary")).unwrap();
        assert_eq!(t.total_tokens(), sum_of_estimates(&t));

        t.truncate_before(1).unwrap();
        assert_eq!(t.total_tokens(), sum_of_estimates(&t));
    }

    #[test]
    fn test_replace_range_rejects_split_exchange() {
        let mut t = store();
        t.append(MessageBody::assistant_tool_calls(
            None,
            vec![call("a", "echo"), call("b", "echo")],
        ))
        .unwrap();
        t.append(MessageBody::tool(ok_result("a", "echo", "1"))).unwrap();
        t.append(MessageBody::tool(ok_result("b", "echo", "2"))).unwrap();

        assert!(t.replace_range(0..2, MessageBody::synthetic("s")).is_err());
        assert!(t.replace_range(1..3, MessageBody::synthetic("s")).is_err());
        assert!(t.replace_range(0..3, MessageBody::synthetic("s")).is_ok());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_replace_range_rejects_open_exchange() {
        let mut t = store();
        t.append(MessageBody::assistant_tool_calls(None, vec![call("a", "echo")]))
            .unwrap();
        assert!(t.replace_range(0..1, MessageBody::synthetic("s")).is_err());
    }

    #[test]
    fn test_ordinals_survive_compaction() {
        let mut t = store();
        t.append(MessageBody::user("u")).unwrap();
        t.append(MessageBody::assistant_tool_calls(None, vec![call("a", "echo")]))
            .unwrap();
        t.append(MessageBody::tool(ok_result("a", "echo", "1"))).unwrap();
        t.append(MessageBody::assistant("done")).unwrap();
        t.replace_range(1..3, MessageBody::synthetic("s")).unwrap();

        let ordinals: Vec<u64> = t.messages().iter().map(|m| m.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 3]);

        // Appends continue past every ordinal ever issued
        t.append(MessageBody::user("next")).unwrap();
        assert_eq!(t.messages()[3].ordinal, 4);
    }

    #[test]
    fn test_truncate_before_refuses_orphaning() {
        let mut t = store();
        t.append(MessageBody::assistant_tool_calls(None, vec![call("a", "echo")]))
            .unwrap();
        t.append(MessageBody::tool(ok_result("a", "echo", "1"))).unwrap();
        assert!(t.truncate_before(1).is_err());
        assert!(t.truncate_before(2).is_ok());
        assert!(t.is_empty());
        assert_eq!(t.total_tokens(), 0);
    }

    #[test]
    fn test_slice_clamps() {
        let mut t = store();
        t.append(MessageBody::user("a")).unwrap();
        t.append(MessageBody::assistant("b")).unwrap();
        assert_eq!(t.slice(1..10).len(), 1);
        assert!(t.slice(5..10).is_empty());
    }

    #[test]
    fn test_last_assistant_text() {
        let mut t = store();
        assert!(t.last_assistant_text().is_none());
        t.append(MessageBody::assistant("first")).unwrap();
        t.append(MessageBody::user("again")).unwrap();
        t.append(MessageBody::assistant_tool_calls(None, vec![call("a", "echo")]))
            .unwrap();
        assert_eq!(t.last_assistant_text(), Some("first"));
    }
}

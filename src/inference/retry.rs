//! Retrying wrapper around a [`CompletionProvider`].
//!
//! Responsibilities:
//! - Bound every attempt with the configured LLM timeout
//! - Retry transient failures with exponential backoff
//! - Reset the provider's connection between attempts
//! - Surface fatal errors immediately and exhaustion as `Unavailable`

use std::sync::Arc;
use std::time::Duration;

use super::errors::ProviderError;
use super::provider::CompletionProvider;
use super::types::{CompletionRequest, ModelResponse};
use crate::config::RetryConfig;

// ─── RetryingCompletionClient ────────────────────────────────────────────────

pub struct RetryingCompletionClient {
    provider: Arc<dyn CompletionProvider>,
    retry: RetryConfig,
    attempt_timeout: Duration,
}

impl std::fmt::Debug for RetryingCompletionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingCompletionClient")
            .field("provider", &self.provider.name())
            .field("retry", &self.retry)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

impl RetryingCompletionClient {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        retry: RetryConfig,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            retry,
            attempt_timeout,
        }
    }

    pub fn provider(&self) -> &Arc<dyn CompletionProvider> {
        &self.provider
    }

    /// Delay before retry number `attempt` (1-based):
    /// `min(base * 2^(attempt - 1), max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self
            .retry
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Request a completion, retrying transient failures.
    ///
    /// Makes at most `max_retries + 1` attempts.
    pub async fn complete(
        &self,
        request: &CompletionRequest<'_>,
    ) -> Result<ModelResponse, ProviderError> {
        let max_attempts = self.retry.max_retries.saturating_add(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.attempt_timeout,
                self.provider.complete(request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    duration_secs: self.attempt_timeout.as_secs(),
                }),
            };

            let err = match result {
                Ok(response) => {
                    if attempt > 1 {
                        tracing::info!(
                            provider = self.provider.name(),
                            attempt,
                            "completion succeeded after retry"
                        );
                    }
                    return Ok(response);
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                tracing::warn!(
                    provider = self.provider.name(),
                    error = %err,
                    "fatal provider error, not retrying"
                );
                return Err(err);
            }

            if attempt >= max_attempts {
                tracing::error!(
                    provider = self.provider.name(),
                    attempts = attempt,
                    error = %err,
                    "provider unavailable, retries exhausted"
                );
                return Err(ProviderError::Unavailable {
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let delay = self.backoff_delay(attempt);
            tracing::warn!(
                provider = self.provider.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient provider error, retrying"
            );
            self.provider.reset_connection();
            tokio::time::sleep(delay).await;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! The seam between sessions and model backends.

use async_trait::async_trait;

use super::errors::ProviderError;
use super::types::{CompletionRequest, ModelResponse};

/// A model backend that turns a transcript into the next reply.
///
/// Implementations make exactly one attempt per call. Retrying, backoff and
/// per-attempt timeouts belong to
/// [`RetryingCompletionClient`](super::retry::RetryingCompletionClient).
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<ModelResponse, ProviderError>;

    /// Drop pooled connections before the next attempt. Called between
    /// retries; the default does nothing.
    fn reset_connection(&self) {}
}

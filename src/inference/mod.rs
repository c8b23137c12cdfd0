//! Model completion layer.
//!
//! - [`CompletionProvider`]: one attempt against a model backend
//! - [`HttpProvider`]: OpenAI-compatible Chat Completions over HTTP
//! - [`RetryingCompletionClient`]: timeouts, backoff and error classification
//!
//! Providers are interchangeable via config; sessions only see the
//! retrying client.

pub mod client;
pub mod errors;
pub mod provider;
pub mod retry;
pub mod types;

pub use client::HttpProvider;
pub use errors::ProviderError;
pub use provider::CompletionProvider;
pub use retry::RetryingCompletionClient;
pub use types::{CompletionRequest, ModelResponse, TokenUsage};

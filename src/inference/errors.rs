//! Provider error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Every variant is
//! classified as transient (worth retrying) or fatal by [`ProviderError::is_transient`];
//! the retrying client relies on that classification alone.

use thiserror::Error;

/// Errors that can occur while requesting a completion.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond within the configured timeout.
    #[error("completion timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The endpoint answered but the payload could not be understood.
    #[error("malformed completion response: {reason}")]
    MalformedResponse { reason: String },

    /// Provider settings are unusable (missing model, bad URL).
    #[error("provider config error: {reason}")]
    ConfigError { reason: String },

    /// Transient failures persisted through every retry.
    #[error(
        "model provider unavailable after {attempts} attempts (last error: {last_error}); \
         check connectivity or raise retry.max_retries"
    )]
    Unavailable { attempts: u32, last_error: String },
}

impl ProviderError {
    /// Whether a retry might succeed.
    ///
    /// Connection failures, timeouts, rate limiting (429), request timeout
    /// (408) and server-side 5xx are transient. Authentication and other
    /// client-side 4xx, malformed payloads, config problems and exhausted
    /// retries are fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::ConnectionFailed { .. } | ProviderError::Timeout { .. } => true,
            ProviderError::HttpError { status, .. } => {
                matches!(*status, 408 | 429) || (500..600).contains(status)
            }
            ProviderError::MalformedResponse { .. }
            | ProviderError::ConfigError { .. }
            | ProviderError::Unavailable { .. } => false,
        }
    }

    /// Authentication or authorization was refused.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ProviderError::HttpError { status: 401 | 403, .. })
    }

    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            ProviderError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }
}

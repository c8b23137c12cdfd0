//! OpenAI-compatible HTTP completion provider.
//!
//! Sends non-streaming chat completion requests to any endpoint speaking the
//! OpenAI Chat Completions API (OpenAI, vLLM, llama.cpp server, Ollama).
//! One attempt per call; the overall per-attempt deadline is enforced by
//! the retrying client, so only the connect timeout is set here.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::errors::ProviderError;
use super::provider::CompletionProvider;
use super::types::{
    parse_completion_response, to_chat_messages, ChatCompletionRequest, CompletionRequest,
    ModelResponse,
};
use crate::config::ProviderSettings;

// ─── HttpProvider ────────────────────────────────────────────────────────────

pub struct HttpProvider {
    http: Mutex<HttpClient>,
    settings: ProviderSettings,
    endpoint: String,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("endpoint", &self.endpoint)
            .field("model", &self.settings.model)
            .finish_non_exhaustive()
    }
}

impl HttpProvider {
    /// Create a provider. Does not check connectivity; that happens on the
    /// first request.
    pub fn new(settings: ProviderSettings) -> Result<Self, ProviderError> {
        if settings.model.trim().is_empty() {
            return Err(ProviderError::ConfigError {
                reason: "provider.model must not be empty".into(),
            });
        }
        let base = settings.base_url.trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ProviderError::ConfigError {
                reason: format!("provider.base_url must be an http(s) URL, got '{base}'"),
            });
        }
        let endpoint = format!("{base}/chat/completions");
        let http = build_http_client(&settings, &endpoint)?;

        Ok(Self {
            http: Mutex::new(http),
            settings,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn client(&self) -> HttpClient {
        // reqwest clients are cheap handles over a shared pool.
        match self.http.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Build the JSON request body for a completion request.
    pub fn request_body(&self, request: &CompletionRequest<'_>) -> serde_json::Value {
        let body = ChatCompletionRequest {
            model: &self.settings.model,
            messages: to_chat_messages(request.system_prompt, request.messages),
            tools: request.tools,
            tool_choice: (!request.tools.is_empty()).then_some("auto"),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            stream: false,
        };
        serde_json::to_value(&body).unwrap_or(serde_json::Value::Null)
    }
}

fn build_http_client(
    settings: &ProviderSettings,
    endpoint: &str,
) -> Result<HttpClient, ProviderError> {
    HttpClient::builder()
        .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
        .build()
        .map_err(|e| ProviderError::ConnectionFailed {
            endpoint: endpoint.to_string(),
            reason: format!("failed to build HTTP client: {e}"),
        })
}

#[async_trait]
impl CompletionProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.settings.model
    }

    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<ModelResponse, ProviderError> {
        let body = self.request_body(request);
        let mut builder = self.client().post(&self.endpoint).json(&body);
        if let Some(key) = self.settings.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.bearer_auth(key);
        }

        tracing::debug!(
            endpoint = %self.endpoint,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "sending completion request"
        );

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    duration_secs: self.settings.connect_timeout_secs,
                }
            } else {
                ProviderError::ConnectionFailed {
                    endpoint: self.endpoint.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| ProviderError::ConnectionFailed {
                endpoint: self.endpoint.clone(),
                reason: format!("failed to read response body: {e}"),
            })?;

        parse_completion_response(
            &body_text,
            self.settings.input_cost_per_mtok,
            self.settings.output_cost_per_mtok,
        )
    }

    fn reset_connection(&self) {
        match build_http_client(&self.settings, &self.endpoint) {
            Ok(fresh) => {
                if let Ok(mut guard) = self.http.lock() {
                    *guard = fresh;
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to rebuild HTTP client"),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::types::{Message, MessageBody};

    fn settings() -> ProviderSettings {
        ProviderSettings {
            base_url: "http://localhost:8080/v1/".into(),
            model: "qwen2.5-coder".into(),
            api_key: None,
            temperature: 0.1,
            max_tokens: 1024,
            connect_timeout_secs: 5,
            input_cost_per_mtok: 0.0,
            output_cost_per_mtok: 0.0,
        }
    }

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let provider = HttpProvider::new(settings()).unwrap();
        assert_eq!(provider.endpoint(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(provider.name(), "qwen2.5-coder");
    }

    #[test]
    fn test_rejects_bad_settings() {
        let mut bad = settings();
        bad.model = " ".into();
        assert!(matches!(
            HttpProvider::new(bad),
            Err(ProviderError::ConfigError { .. })
        ));

        let mut bad = settings();
        bad.base_url = "localhost:8080".into();
        assert!(matches!(
            HttpProvider::new(bad),
            Err(ProviderError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_request_body_shape() {
        let provider = HttpProvider::new(settings()).unwrap();
        let messages = vec![Message {
            ordinal: 0,
            timestamp: "2026-01-01T00:00:00Z".into(),
            token_count: 3,
            body: MessageBody::user("hello"),
        }];
        let tools = vec![serde_json::json!({"type": "function", "function": {"name": "ls"}})];

        let body = provider.request_body(&CompletionRequest {
            system_prompt: Some("sys"),
            messages: &messages,
            tools: &tools,
        });
        assert_eq!(body["model"], "qwen2.5-coder");
        assert_eq!(body["stream"], false);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["tools"][0]["function"]["name"], "ls");

        let no_tools = provider.request_body(&CompletionRequest {
            system_prompt: None,
            messages: &messages,
            tools: &[],
        });
        assert!(no_tools.get("tools").is_none());
        assert!(no_tools.get("tool_choice").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let mut s = settings();
        // Port 9 (discard) on loopback is essentially never listening.
        s.base_url = "http://127.0.0.1:9".into();
        let provider = HttpProvider::new(s).unwrap();
        let err = provider
            .complete(&CompletionRequest {
                system_prompt: None,
                messages: &[],
                tools: &[],
            })
            .await
            .unwrap_err();
        assert!(err.is_transient(), "got {err:?}");
    }
}

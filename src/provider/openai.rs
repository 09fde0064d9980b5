//! OpenAI-compatible chat completion provider

use super::{Completion, CompletionProvider, CompletionRequest, ProviderError, TokenUsage};
use crate::config::ProviderConfig;
use crate::context::PromptMessage;
use crate::error::Result;
use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Default ceiling for a Retry-After hint
const DEFAULT_MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Chat completion provider over HTTP
pub struct OpenAiProvider {
    http: Client,
    api_url: String,
    api_key: SecretString,
    json_response: bool,
    max_retry_after: Duration,
}

impl OpenAiProvider {
    /// Create a provider with a bounded per-call timeout
    pub fn new(
        api_url: impl Into<String>,
        api_key: SecretString,
        timeout: Duration,
    ) -> std::result::Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        Ok(Self {
            http,
            api_url: api_url.into(),
            api_key,
            json_response: false,
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
        })
    }

    /// Build from configuration, resolving the API key
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let provider = Self::new(config.api_url.clone(), api_key, config.timeout())
            .map_err(|e| crate::error::PipelineError::configuration(e.to_string()))?;
        Ok(provider
            .with_json_response(config.json_response)
            .with_max_retry_after(config.max_retry_after()))
    }

    /// Ask the model for a JSON object reply
    pub fn with_json_response(mut self, enabled: bool) -> Self {
        self.json_response = enabled;
        self
    }

    /// Longest wait a Retry-After header may impose
    pub fn with_max_retry_after(mut self, limit: Duration) -> Self {
        self.max_retry_after = limit;
        self
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<Completion, ProviderError> {
        let body = ChatCompletionRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
            response_format: self.json_response.then_some(ResponseFormat { kind: "json_object" }),
        };

        debug!(model = %request.model, messages = request.messages.len(), "Calling chat completion API");

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER), self.max_retry_after);
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_status(status, retry_after, error_text));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".to_string()))?;

        let usage = parsed.usage.map(|usage| TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        });

        Ok(Completion::new(text, usage))
    }
}

/// Map an HTTP error status onto the provider error taxonomy
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> ProviderError {
    let detail = format!("Status {}: {}", status, body);
    match status.as_u16() {
        429 => ProviderError::RateLimited { retry_after },
        401 | 403 => ProviderError::Authentication(detail),
        404 => ProviderError::NotFound(detail),
        400 | 413 | 422 => ProviderError::InvalidRequest(detail),
        408 => ProviderError::Timeout(detail),
        _ => ProviderError::Transient(detail),
    }
}

/// Retry-After in seconds, clamped to `limit`; values a `Duration` cannot hold count as `limit`
fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>, limit: Duration) -> Option<Duration> {
    let seconds: f64 = value?.to_str().ok()?.trim().parse().ok()?;
    if seconds.is_nan() || seconds < 0.0 {
        return None;
    }
    let requested = Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX);
    if requested > limit {
        warn!(requested_secs = seconds, limit = ?limit, "Retry-After exceeds limit, clamping");
        return Some(limit);
    }
    Some(requested)
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

//! Completion provider boundary
//!
//! The [`CompletionProvider`] trait is the seam to the external LLM service.
//! Every provider error is mapped to an [`ErrorClass`], which decides whether a
//! call is retried, the row is skipped, or the whole batch stops.

pub mod client;
pub mod openai;
pub mod retry;

use crate::context::PromptMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use client::{CompletionClient, CompletionResult, SendFailure};
pub use openai::OpenAiProvider;
pub use retry::{ErrorClassifier, ProviderErrorClassifier, RetryFailure, RetryPolicy, Sleeper, TokioSleeper};

/// How a failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff
    RateLimited,
    /// Retried with the same schedule
    Transient,
    /// Aborts the batch
    Permanent,
    /// Skips the row without retrying
    Malformed,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::RateLimited | ErrorClass::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Malformed => "malformed",
        }
    }
}

/// Completion provider errors
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Model or endpoint not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::RateLimited { .. } => ErrorClass::RateLimited,
            ProviderError::Timeout(_)
            | ProviderError::Transient(_)
            | ProviderError::InvalidResponse(_) => ErrorClass::Transient,
            ProviderError::Authentication(_) | ProviderError::NotFound(_) => ErrorClass::Permanent,
            ProviderError::InvalidRequest(_) => ErrorClass::Malformed,
        }
    }

    /// Server-suggested wait before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// A chat completion request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<PromptMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_output_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }
}

/// Token usage reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Raw provider reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    /// Absent when the provider did not report usage
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn new(text: impl Into<String>, usage: Option<TokenUsage>) -> Self {
        Self {
            text: text.into(),
            usage,
        }
    }
}

/// External LLM completion service
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;
}

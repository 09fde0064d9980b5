//! Completion client: one provider call under the retry policy

use super::retry::{ProviderErrorClassifier, RetryFailure, RetryPolicy, Sleeper, TokioSleeper};
use super::{CompletionProvider, CompletionRequest, ProviderError};
use crate::context::{PromptMessage, TokenAccountant};
use crate::metrics::METRICS;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// Reply text plus token usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResult {
    pub text: String,
    pub token_input: usize,
    pub token_output: usize,
}

/// Failure sentinel returned by [`CompletionClient::send`]
#[derive(Debug, Clone, Error)]
pub enum SendFailure {
    /// Retryable errors persisted through every attempt
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: ProviderError },

    /// No row can succeed; the batch must stop
    #[error("permanent provider failure: {0}")]
    Permanent(ProviderError),

    /// The request itself was rejected; only this row is affected
    #[error("request rejected: {0}")]
    Skipped(ProviderError),
}

impl SendFailure {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SendFailure::Permanent(_))
    }

    pub fn error(&self) -> &ProviderError {
        match self {
            SendFailure::Exhausted { last, .. } => last,
            SendFailure::Permanent(err) | SendFailure::Skipped(err) => err,
        }
    }
}

impl From<RetryFailure<ProviderError>> for SendFailure {
    fn from(failure: RetryFailure<ProviderError>) -> Self {
        match failure {
            RetryFailure::Exhausted { attempts, error } => SendFailure::Exhausted { attempts, last: error },
            RetryFailure::Aborted { error, .. } => SendFailure::Permanent(error),
            RetryFailure::Rejected { error, .. } => SendFailure::Skipped(error),
        }
    }
}

/// Sends prompts to a [`CompletionProvider`] with classification and backoff.
///
/// Stateless apart from its collaborators, so it can be shared across workers.
pub struct CompletionClient {
    provider: Arc<dyn CompletionProvider>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    accountant: Arc<TokenAccountant>,
    temperature: Option<f32>,
    max_output_tokens: Option<u32>,
}

impl CompletionClient {
    pub fn new(provider: Arc<dyn CompletionProvider>, policy: RetryPolicy) -> Self {
        Self {
            provider,
            policy,
            sleeper: Arc::new(TokioSleeper),
            accountant: Arc::new(TokenAccountant::new()),
            temperature: None,
            max_output_tokens: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Used to estimate usage when the provider reports none
    pub fn with_accountant(mut self, accountant: Arc<TokenAccountant>) -> Self {
        self.accountant = accountant;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: Option<u32>) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send `messages` to `model`
    pub async fn send(&self, messages: &[PromptMessage], model: &str) -> Result<CompletionResult, SendFailure> {
        let mut request = CompletionRequest::new(model, messages.to_vec());
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(tokens) = self.max_output_tokens {
            request = request.with_max_output_tokens(tokens);
        }

        let provider = self.provider.name().to_string();
        let completion = self
            .policy
            .run("completion", self.sleeper.as_ref(), &ProviderErrorClassifier, |attempt| {
                let request = &request;
                let provider = provider.as_str();
                async move {
                    let start = Instant::now();
                    let result = self.provider.complete(request).await;
                    METRICS.record_provider_attempt(provider, result.is_ok(), start.elapsed().as_secs_f64());
                    debug!(provider, attempt, success = result.is_ok(), "Completion attempt finished");
                    result
                }
            })
            .await?;

        let (token_input, token_output) = match completion.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => {
                warn!(model, "Provider reported no usage, estimating tokens");
                let input = messages
                    .iter()
                    .map(|m| self.accountant.cost(&m.content, model))
                    .sum();
                (input, self.accountant.cost(&completion.text, model))
            }
        };
        METRICS.record_tokens(token_input, token_output);

        Ok(CompletionResult {
            text: completion.text,
            token_input,
            token_output,
        })
    }
}

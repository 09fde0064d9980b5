//! Retry policy with linear-growth backoff
//!
//! One policy object serves every external-call boundary (provider calls and
//! checkpoint flushes). The delay after failed attempt `n` is
//! `base_delay * n`, raised to any server hint and never lower than the
//! previous delay.

use super::{ErrorClass, ProviderError};
use async_trait::async_trait;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Waits between attempts
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Maps an error to its handling class
pub trait ErrorClassifier<E>: Send + Sync {
    fn classify(&self, error: &E) -> ErrorClass;

    /// Minimum wait requested by the remote side, if any
    fn retry_after(&self, _error: &E) -> Option<Duration> {
        None
    }
}

impl<E, F> ErrorClassifier<E> for F
where
    F: Fn(&E) -> ErrorClass + Send + Sync,
{
    fn classify(&self, error: &E) -> ErrorClass {
        self(error)
    }
}

/// Classifier for completion provider errors, honouring Retry-After
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderErrorClassifier;

impl ErrorClassifier<ProviderError> for ProviderErrorClassifier {
    fn classify(&self, error: &ProviderError) -> ErrorClass {
        error.class()
    }

    fn retry_after(&self, error: &ProviderError) -> Option<Duration> {
        error.retry_after()
    }
}

/// Why a retried operation gave up
#[derive(Debug, Error)]
pub enum RetryFailure<E> {
    #[error("gave up after {attempts} attempts: {error}")]
    Exhausted { attempts: u32, error: E },

    #[error("aborted on attempt {attempts}: {error}")]
    Aborted { attempts: u32, error: E },

    #[error("rejected on attempt {attempts}: {error}")]
    Rejected { attempts: u32, error: E },
}

impl<E> RetryFailure<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryFailure::Exhausted { attempts, .. }
            | RetryFailure::Aborted { attempts, .. }
            | RetryFailure::Rejected { attempts, .. } => *attempts,
        }
    }

    pub fn error(&self) -> &E {
        match self {
            RetryFailure::Exhausted { error, .. }
            | RetryFailure::Aborted { error, .. }
            | RetryFailure::Rejected { error, .. } => error,
        }
    }
}

/// Retry parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    /// `max_retries` is the total number of attempts (at least one)
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Scheduled delay after failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable class, or
    /// `max_retries` attempts are spent. The closure receives the 1-based
    /// attempt number.
    pub async fn run<T, E, C, Op, Fut>(
        &self,
        label: &str,
        sleeper: &dyn Sleeper,
        classifier: &C,
        mut operation: Op,
    ) -> Result<T, RetryFailure<E>>
    where
        E: Display,
        C: ErrorClassifier<E> + ?Sized,
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut previous_delay = Duration::ZERO;
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(operation = label, attempt, "Attempting operation");

            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let class = classifier.classify(&err);
            match class {
                ErrorClass::Permanent => {
                    error!(operation = label, attempt, "Permanent failure: {}", err);
                    return Err(RetryFailure::Aborted { attempts: attempt, error: err });
                }
                ErrorClass::Malformed => {
                    warn!(operation = label, attempt, "Request rejected, not retrying: {}", err);
                    return Err(RetryFailure::Rejected { attempts: attempt, error: err });
                }
                ErrorClass::RateLimited | ErrorClass::Transient => {}
            }

            if attempt >= self.max_retries {
                error!(operation = label, attempts = attempt, "Giving up: {}", err);
                return Err(RetryFailure::Exhausted { attempts: attempt, error: err });
            }

            let hint = classifier.retry_after(&err).unwrap_or(Duration::ZERO);
            let delay = self.backoff(attempt).max(hint).max(previous_delay);
            warn!(
                operation = label,
                attempt,
                class = class.as_str(),
                "Attempt failed: {}, retrying in {:?}",
                err,
                delay
            );
            crate::metrics::METRICS
                .retries
                .with_label_values(&[label, class.as_str()])
                .inc();

            sleeper.sleep(delay).await;
            previous_delay = delay;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

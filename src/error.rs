//! Crate-wide error taxonomy

use crate::provider::ProviderError;
use thiserror::Error;

/// Errors that stop a batch run (or prevent it from starting)
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Fatal pre-flight problem: missing column, template, credential or bad setting
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Provider failure that no row can recover from (auth, unknown model)
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Checkpoint or output persistence failed after retries
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    pub fn persistence(reason: impl Into<String>) -> Self {
        Self::Persistence(reason.into())
    }

    /// Whether this error was raised before any row was processed
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

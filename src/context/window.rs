//! Token-budgeted conversation window
//!
//! Tracks the running token cost of a fixed system prompt plus the messages
//! accumulated across a batch run. When the budget is exceeded the whole
//! history is discarded in one step (hard reset): every classification call is
//! independent, so the history only provides short continuity and is never
//! evicted piecemeal.

use super::models::{MessageRole, PromptMessage};
use super::token_estimator::TokenEstimator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextWindowConfig {
    /// Maximum tokens a single prompt may carry
    pub token_budget: usize,
    /// Fixed framing cost added to every message
    pub per_message_overhead: usize,
}

impl Default for ContextWindowConfig {
    fn default() -> Self {
        Self {
            token_budget: 8192,
            per_message_overhead: 4,
        }
    }
}

impl ContextWindowConfig {
    pub fn validate(&self) -> Result<(), BudgetError> {
        if self.token_budget == 0 {
            return Err(BudgetError::ConfigurationInvalid(
                "token budget must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Token budget errors
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("System prompt needs {needed} tokens but the budget is {budget}")]
    SystemPromptTooLarge { needed: usize, budget: usize },

    #[error("Configuration invalid: {0}")]
    ConfigurationInvalid(String),
}

#[derive(Debug, Clone)]
struct WindowEntry {
    message: PromptMessage,
    cost: usize,
}

/// Conversation state for one batch run.
///
/// `token_count` always equals the cost of the system prompt plus the cost of
/// every message in the history. Only [`add`](Self::add) and
/// [`reset`](Self::reset) mutate it (`get_prompt` resets when over budget).
pub struct ContextWindow {
    config: ContextWindowConfig,
    estimator: Arc<dyn TokenEstimator>,
    system_prompt: PromptMessage,
    system_cost: usize,
    history: Vec<WindowEntry>,
    token_count: usize,
    resets: usize,
}

impl ContextWindow {
    /// Create a window around a fixed system prompt
    pub fn new(
        system_prompt: impl Into<String>,
        config: ContextWindowConfig,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<Self, BudgetError> {
        config.validate()?;

        let system_prompt = PromptMessage::system(system_prompt);
        let system_cost = estimator.estimate(&system_prompt.content) + config.per_message_overhead;
        if system_cost > config.token_budget {
            return Err(BudgetError::SystemPromptTooLarge {
                needed: system_cost,
                budget: config.token_budget,
            });
        }

        Ok(Self {
            config,
            estimator,
            system_prompt,
            system_cost,
            history: Vec::new(),
            token_count: system_cost,
            resets: 0,
        })
    }

    /// Cost a message of `text` would add to the window
    pub fn message_cost(&self, text: &str) -> usize {
        self.estimator.estimate(text) + self.config.per_message_overhead
    }

    /// Append a message and account for its cost
    pub fn add(&mut self, role: MessageRole, text: impl Into<String>) {
        let message = PromptMessage::new(role, text);
        let cost = self.message_cost(&message.content);
        self.token_count += cost;
        self.history.push(WindowEntry { message, cost });

        debug!(
            role = %role,
            cost,
            token_count = self.token_count,
            "Added message to context window"
        );
    }

    /// Whether adding `text` would push the window past its budget
    pub fn would_exceed(&self, text: &str) -> bool {
        self.token_count + self.message_cost(text) > self.config.token_budget
    }

    /// Messages to send: the system prompt followed by the history.
    ///
    /// Performs a hard reset first if the window is over budget, so the
    /// returned list always fits. Calling it again without an intervening
    /// `add` returns the same list.
    pub fn get_prompt(&mut self) -> Vec<PromptMessage> {
        if self.token_count > self.config.token_budget {
            info!(
                token_count = self.token_count,
                budget = self.config.token_budget,
                "Token limit exceeded, resetting conversation state"
            );
            self.reset();
        }

        std::iter::once(self.system_prompt.clone())
            .chain(self.history.iter().map(|entry| entry.message.clone()))
            .collect()
    }

    /// Discard the whole history, keeping the system prompt
    pub fn reset(&mut self) {
        self.history.clear();
        self.token_count = self.system_cost;
        self.resets += 1;
        crate::metrics::METRICS.context_resets.inc();
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn token_budget(&self) -> usize {
        self.config.token_budget
    }

    /// Number of hard resets performed so far
    pub fn resets(&self) -> usize {
        self.resets
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt.content
    }

    /// Recomputed cost of the current contents
    #[cfg(test)]
    fn recount(&self) -> usize {
        self.system_cost + self.history.iter().map(|entry| entry.cost).sum::<usize>()
    }
}

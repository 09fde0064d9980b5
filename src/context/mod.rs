//! Conversation context with token budget enforcement
//!
//! Token accounting per model and the hard-reset context window shared by the
//! calls of one batch run.

pub mod models;
pub mod token_estimator;
pub mod window;

pub use models::{MessageRole, PromptMessage};
pub use token_estimator::{TiktokenEstimator, TokenAccountant, TokenEstimator, WordBasedEstimator};
pub use window::{BudgetError, ContextWindow, ContextWindowConfig};

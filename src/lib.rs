//! Batch classification of shipment tracking histories with an LLM
//!
//! Rows of a table are turned into bounded prompts, sent to a completion
//! provider under a retry policy, and recorded with periodic checkpoints so
//! an interrupted run resumes where it stopped.

pub mod batch;
pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod prompt;
pub mod provider;

pub use batch::{BatchReport, BatchRunner, BatchSettings, BatchState, CancelFlag, PredictionRecord};
pub use config::Config;
pub use error::{PipelineError, Result};

//! Token estimation using tiktoken, resolved per model

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tiktoken_rs::{cl100k_base, get_bpe_from_model, CoreBPE};
use tracing::{debug, warn};

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;
}

/// Tiktoken-based token estimator
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    /// Create a new tiktoken estimator with cl100k_base encoding
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self::from_bpe(cl100k_base()?))
    }

    /// Create the estimator matching a model id (e.g. `gpt-4-turbo`)
    pub fn for_model(model: &str) -> anyhow::Result<Self> {
        Ok(Self::from_bpe(get_bpe_from_model(model)?))
    }

    fn from_bpe(bpe: CoreBPE) -> Self {
        Self { bpe: Arc::new(bpe) }
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Word-based token estimator (fallback, ~1.3 tokens per word)
pub struct WordBasedEstimator {
    tokens_per_word: f64,
}

impl WordBasedEstimator {
    pub fn new(tokens_per_word: f64) -> Self {
        Self { tokens_per_word }
    }
}

impl Default for WordBasedEstimator {
    fn default() -> Self {
        Self::new(1.3)
    }
}

impl TokenEstimator for WordBasedEstimator {
    fn estimate(&self, text: &str) -> usize {
        let word_count = text.split_whitespace().count();
        (word_count as f64 * self.tokens_per_word).ceil() as usize
    }
}

/// Resolves the tokenizer for a model and prices text in tokens.
///
/// Encoders are built lazily and cached per model id. An unknown model falls
/// back to `cl100k_base` (and to word counting if even that cannot load), with
/// one warning per model id. `cost` never fails.
pub struct TokenAccountant {
    encoders: Mutex<HashMap<String, Arc<dyn TokenEstimator>>>,
}

impl TokenAccountant {
    pub fn new() -> Self {
        Self {
            encoders: Mutex::new(HashMap::new()),
        }
    }

    /// Token cost of `text` under `model`'s tokenizer
    pub fn cost(&self, text: &str, model: &str) -> usize {
        self.estimator_for(model).estimate(text)
    }

    /// Shared estimator for `model`, built on first use
    pub fn estimator_for(&self, model: &str) -> Arc<dyn TokenEstimator> {
        let mut encoders = self.encoders.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(estimator) = encoders.get(model) {
            return Arc::clone(estimator);
        }

        let estimator: Arc<dyn TokenEstimator> = match TiktokenEstimator::for_model(model) {
            Ok(estimator) => {
                debug!(model, "Loaded tokenizer for model");
                Arc::new(estimator)
            }
            Err(e) => {
                warn!(model, "Unknown model for tokenization, using default encoding: {}", e);
                default_estimator()
            }
        };

        encoders.insert(model.to_string(), Arc::clone(&estimator));
        estimator
    }
}

impl Default for TokenAccountant {
    fn default() -> Self {
        Self::new()
    }
}

fn default_estimator() -> Arc<dyn TokenEstimator> {
    match TiktokenEstimator::new() {
        Ok(estimator) => Arc::new(estimator),
        Err(e) => {
            warn!("cl100k_base unavailable, falling back to word-based estimation: {}", e);
            Arc::new(WordBasedEstimator::default())
        }
    }
}

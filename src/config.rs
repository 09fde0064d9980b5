//! Configuration for the classification pipeline
//!
//! Loaded once at startup from an optional file plus `CLASSIFIER__*`
//! environment variables, validated, then passed around read-only.

use crate::context::ContextWindowConfig;
use crate::error::{PipelineError, Result};
use crate::provider::RetryPolicy;
use indexmap::IndexMap;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Model whose pricing row is used for unknown models
pub const FALLBACK_PRICING_MODEL: &str = "gpt-3.5-turbo";

/// Top-level configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub pricing: PricingTable,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Batch pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Selects tokenizer and pricing row
    #[serde(default = "default_model")]
    pub model: String,

    /// Maximum context size in tokens
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Rows between checkpoint flushes
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    /// Total attempts per provider call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_prompt_template_id")]
    pub prompt_template_id: String,

    /// Free-text scan history column
    #[serde(default = "default_scan_history_column")]
    pub scan_history_column: String,

    #[serde(default = "default_id_column")]
    pub id_column: String,

    #[serde(default = "default_carrier_column")]
    pub carrier_column: String,

    /// Most recent scan events kept per shipment
    #[serde(default = "default_max_scan_events")]
    pub max_scan_events: usize,

    /// Fixed token overhead charged per message
    #[serde(default = "default_per_message_overhead")]
    pub per_message_overhead: usize,

    /// Send the accumulated context window with each call
    #[serde(default = "default_true")]
    pub share_context: bool,

    /// Compact the checkpoint log after a completed run
    #[serde(default = "default_true")]
    pub compact_on_finish: bool,
}

/// Completion provider settings
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// API key (read from `api_key_env` if not set)
    #[serde(default)]
    pub api_key: Option<SecretString>,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Base backoff in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper bound on a server-requested Retry-After wait, in milliseconds
    #[serde(default = "default_max_retry_after_ms")]
    pub max_retry_after_ms: u64,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default)]
    pub max_output_tokens: Option<u32>,

    /// Request a JSON object reply
    #[serde(default)]
    pub json_response: bool,
}

/// File locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,

    /// Status label catalog (JSON array or one label per line)
    #[serde(default)]
    pub status_catalog: Option<PathBuf>,

    #[serde(default = "default_checkpoint_path")]
    pub checkpoint: PathBuf,

    #[serde(default)]
    pub input: Option<PathBuf>,

    #[serde(default = "default_output_path")]
    pub output: PathBuf,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

/// Per-1K-token prices for one model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// `(input/1000)*input_rate + (output/1000)*output_rate`
    pub fn cost(&self, token_input: usize, token_output: usize) -> f64 {
        (token_input as f64 / 1000.0) * self.input_per_1k + (token_output as f64 / 1000.0) * self.output_per_1k
    }
}

/// Model pricing table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    models: IndexMap<String, ModelPricing>,
}

impl Default for PricingTable {
    fn default() -> Self {
        let models = [
            ("gpt-3.5-turbo", ModelPricing::new(0.001, 0.002)),
            ("gpt-4", ModelPricing::new(0.03, 0.06)),
            ("gpt-4-turbo", ModelPricing::new(0.01, 0.03)),
            ("gpt-4o", ModelPricing::new(0.03, 0.06)),
            ("gpt-4o-mini", ModelPricing::new(0.00015, 0.0006)),
        ]
        .into_iter()
        .map(|(model, pricing)| (model.to_string(), pricing))
        .collect();
        Self { models }
    }
}

impl PricingTable {
    /// Add the built-in rows for models the table does not list
    pub fn with_defaults(mut self) -> Self {
        for (model, pricing) in PricingTable::default().models {
            self.models.entry(model).or_insert(pricing);
        }
        self
    }

    /// Pricing row for `model`, falling back to gpt-3.5-turbo
    pub fn pricing_for(&self, model: &str) -> Option<ModelPricing> {
        if let Some(pricing) = self.models.get(model) {
            return Some(*pricing);
        }
        warn!(model, "No pricing for model, using {}", FALLBACK_PRICING_MODEL);
        self.models.get(FALLBACK_PRICING_MODEL).copied()
    }

    /// Cost of one call to `model`; zero when no pricing row applies
    pub fn estimated_cost(&self, model: &str, token_input: usize, token_output: usize) -> f64 {
        self.pricing_for(model)
            .map_or(0.0, |pricing| pricing.cost(token_input, token_output))
    }
}

// Default value functions
fn default_model() -> String { "gpt-4-turbo".to_string() }
fn default_token_budget() -> usize { 8192 }
fn default_checkpoint_interval() -> usize { 50 }
fn default_max_retries() -> u32 { 3 }
fn default_prompt_template_id() -> String { "shipment_status".to_string() }
fn default_scan_history_column() -> String { "ScanGroups".to_string() }
fn default_id_column() -> String { "tracking_number".to_string() }
fn default_carrier_column() -> String { "carrier".to_string() }
fn default_max_scan_events() -> usize { 30 }
fn default_per_message_overhead() -> usize { 4 }
fn default_true() -> bool { true }
fn default_api_url() -> String { "https://api.openai.com/v1/chat/completions".to_string() }
fn default_api_key_env() -> String { "OPENAI_API_KEY".to_string() }
fn default_timeout_ms() -> u64 { 60_000 }
fn default_retry_base_delay_ms() -> u64 { 5_000 }
fn default_max_retry_after_ms() -> u64 { 60_000 }
fn default_template_dir() -> PathBuf { PathBuf::from("data/prompts") }
fn default_checkpoint_path() -> PathBuf { PathBuf::from("output/checkpoint.jsonl") }
fn default_output_path() -> PathBuf { PathBuf::from("output/predictions.jsonl") }
fn default_log_level() -> String { "info".to_string() }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            token_budget: default_token_budget(),
            checkpoint_interval: default_checkpoint_interval(),
            max_retries: default_max_retries(),
            prompt_template_id: default_prompt_template_id(),
            scan_history_column: default_scan_history_column(),
            id_column: default_id_column(),
            carrier_column: default_carrier_column(),
            max_scan_events: default_max_scan_events(),
            per_message_overhead: default_per_message_overhead(),
            share_context: true,
            compact_on_finish: true,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            api_key_env: default_api_key_env(),
            timeout_ms: default_timeout_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_retry_after_ms: default_max_retry_after_ms(),
            temperature: 0.0,
            max_output_tokens: None,
            json_response: false,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            template_dir: default_template_dir(),
            status_catalog: None,
            checkpoint: default_checkpoint_path(),
            input: None,
            output: default_output_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load from an optional file, then `CLASSIFIER__SECTION__KEY` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CLASSIFIER")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Config = builder.build()?.try_deserialize()?;
        config.pricing = config.pricing.with_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Pre-flight checks that need no I/O
    pub fn validate(&self) -> Result<()> {
        let pipeline = &self.pipeline;
        if pipeline.token_budget == 0 {
            return Err(PipelineError::configuration("pipeline.token_budget must be positive"));
        }
        if pipeline.checkpoint_interval == 0 {
            return Err(PipelineError::configuration("pipeline.checkpoint_interval must be positive"));
        }
        if pipeline.max_retries == 0 {
            return Err(PipelineError::configuration("pipeline.max_retries must be positive"));
        }
        if pipeline.max_scan_events == 0 {
            return Err(PipelineError::configuration("pipeline.max_scan_events must be positive"));
        }
        for (name, value) in [
            ("pipeline.model", &pipeline.model),
            ("pipeline.prompt_template_id", &pipeline.prompt_template_id),
            ("pipeline.scan_history_column", &pipeline.scan_history_column),
            ("pipeline.id_column", &pipeline.id_column),
            ("pipeline.carrier_column", &pipeline.carrier_column),
        ] {
            if value.trim().is_empty() {
                return Err(PipelineError::configuration(format!("{} must not be empty", name)));
            }
        }

        reqwest::Url::parse(&self.provider.api_url).map_err(|e| {
            PipelineError::configuration(format!("provider.api_url is invalid: {}", e))
        })?;
        if self.provider.timeout_ms == 0 {
            return Err(PipelineError::configuration("provider.timeout_ms must be positive"));
        }

        Ok(())
    }

    pub fn context_window(&self) -> ContextWindowConfig {
        ContextWindowConfig {
            token_budget: self.pipeline.token_budget,
            per_message_overhead: self.pipeline.per_message_overhead,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.pipeline.max_retries, self.provider.retry_base_delay())
    }
}

impl ProviderConfig {
    /// Get timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Get retry base delay as Duration
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Cap applied to Retry-After hints
    pub fn max_retry_after(&self) -> Duration {
        Duration::from_millis(self.max_retry_after_ms)
    }

    /// Configured key, else the `api_key_env` variable
    pub fn resolve_api_key(&self) -> Result<SecretString> {
        if let Some(key) = &self.api_key {
            if !key.expose_secret().trim().is_empty() {
                return Ok(SecretString::new(key.expose_secret().clone()));
            }
        }

        match std::env::var(&self.api_key_env) {
            Ok(value) if !value.trim().is_empty() => Ok(SecretString::new(value)),
            _ => Err(PipelineError::configuration(format!(
                "no API key configured and {} is not set",
                self.api_key_env
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pipeline.model, "gpt-4-turbo");
        assert_eq!(config.pipeline.token_budget, 8192);
        assert_eq!(config.pipeline.checkpoint_interval, 50);
        assert_eq!(config.pipeline.max_retries, 3);
        assert_eq!(config.pipeline.scan_history_column, "ScanGroups");
        assert_eq!(config.provider.retry_base_delay(), Duration::from_secs(5));
        assert_eq!(config.provider.max_retry_after(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[pipeline]\nmodel = \"gpt-4\"\ntoken_budget = 4096\ncheckpoint_interval = 10\n\n\
             [pricing.custom-model]\ninput_per_1k = 0.5\noutput_per_1k = 1.0"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.pipeline.model, "gpt-4");
        assert_eq!(config.pipeline.token_budget, 4096);
        assert_eq!(config.pipeline.checkpoint_interval, 10);
        assert_eq!(config.pipeline.max_retries, 3);
        assert_eq!(config.pricing.estimated_cost("custom-model", 1000, 1000), 1.5);
        assert!(config.pricing.pricing_for("gpt-4o").is_some());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.pipeline.token_budget = 0;
        assert!(config.validate().unwrap_err().is_configuration());

        let mut config = Config::default();
        config.pipeline.scan_history_column = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.provider.api_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_estimated_cost() {
        let pricing = PricingTable::default();
        let cost = pricing.estimated_cost("gpt-4-turbo", 2000, 500);
        assert!((cost - (2.0 * 0.01 + 0.5 * 0.03)).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_model_uses_fallback_pricing() {
        let pricing = PricingTable::default();
        assert_eq!(
            pricing.estimated_cost("mystery-model", 1000, 1000),
            pricing.estimated_cost("gpt-3.5-turbo", 1000, 1000)
        );
    }

    #[test]
    fn test_resolve_api_key() {
        let mut provider = ProviderConfig::default();
        provider.api_key_env = "CLASSIFIER_TEST_MISSING_KEY".to_string();
        assert!(provider.resolve_api_key().unwrap_err().is_configuration());

        provider.api_key = Some(SecretString::new("sk-test".to_string()));
        assert_eq!(provider.resolve_api_key().unwrap().expose_secret(), "sk-test");

        std::env::set_var("CLASSIFIER_TEST_PRESENT_KEY", "sk-env");
        provider.api_key = None;
        provider.api_key_env = "CLASSIFIER_TEST_PRESENT_KEY".to_string();
        assert_eq!(provider.resolve_api_key().unwrap().expose_secret(), "sk-env");
        std::env::remove_var("CLASSIFIER_TEST_PRESENT_KEY");
    }
}

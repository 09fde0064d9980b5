//! Metrics collection for observability

use prometheus::{
    Counter, CounterVec, HistogramVec, Opts, Registry,
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_vec_with_registry,
};
use std::sync::Arc;
use once_cell::sync::Lazy;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    Arc::new(Metrics::new().expect("Failed to initialize metrics"))
});

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Batch metrics
    pub rows_processed: CounterVec,
    pub checkpoint_flushes: CounterVec,

    // Provider metrics
    pub provider_requests: CounterVec,
    pub provider_request_duration: HistogramVec,
    pub retries: CounterVec,
    pub tokens: CounterVec,

    // Context window metrics
    pub context_resets: Counter,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let rows_processed = register_counter_vec_with_registry!(
            Opts::new("classifier_rows_total", "Rows processed by outcome"),
            &["outcome"],
            registry
        )?;

        let checkpoint_flushes = register_counter_vec_with_registry!(
            Opts::new("classifier_checkpoint_flushes_total", "Checkpoint flushes by status"),
            &["status"],
            registry
        )?;

        let provider_requests = register_counter_vec_with_registry!(
            Opts::new("classifier_provider_requests_total", "Completion attempts by outcome"),
            &["provider", "outcome"],
            registry
        )?;

        let provider_request_duration = register_histogram_vec_with_registry!(
            "classifier_provider_request_duration_seconds",
            "Completion attempt duration in seconds",
            &["provider"],
            registry
        )?;

        let retries = register_counter_vec_with_registry!(
            Opts::new("classifier_retries_total", "Retries by operation and error class"),
            &["operation", "class"],
            registry
        )?;

        let tokens = register_counter_vec_with_registry!(
            Opts::new("classifier_tokens_total", "Tokens consumed by direction"),
            &["direction"],
            registry
        )?;

        let context_resets = register_counter_with_registry!(
            Opts::new("classifier_context_resets_total", "Hard resets of the context window"),
            registry
        )?;

        Ok(Self {
            registry,
            rows_processed,
            checkpoint_flushes,
            provider_requests,
            provider_request_duration,
            retries,
            tokens,
            context_resets,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome of one row
    pub fn record_row(&self, outcome: &str) {
        self.rows_processed.with_label_values(&[outcome]).inc();
    }

    /// Record one completion attempt
    pub fn record_provider_attempt(&self, provider: &str, success: bool, seconds: f64) {
        let outcome = if success { "success" } else { "error" };
        self.provider_requests.with_label_values(&[provider, outcome]).inc();
        self.provider_request_duration
            .with_label_values(&[provider])
            .observe(seconds);
    }

    /// Record token usage of a successful completion
    pub fn record_tokens(&self, input: usize, output: usize) {
        self.tokens.with_label_values(&["input"]).inc_by(input as f64);
        self.tokens.with_label_values(&["output"]).inc_by(output as f64);
    }

    /// Record a checkpoint flush
    pub fn record_flush(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        self.checkpoint_flushes.with_label_values(&[status]).inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}

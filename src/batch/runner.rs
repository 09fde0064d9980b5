//! Batch runner: rows in, one prediction per row out
//!
//! Rows are processed strictly in table order. Each row is built into a
//! prompt, sent through the completion client and recorded; records are
//! buffered and flushed to the checkpoint store every `checkpoint_interval`
//! rows and once more at the end.

use super::checkpoint::CheckpointStore;
use super::record::{extract_status, PredictionRecord};
use super::table::{cell_text, Row, Table};
use crate::config::{Config, PricingTable};
use crate::context::{ContextWindow, ContextWindowConfig, MessageRole, TokenAccountant};
use crate::error::{PipelineError, Result};
use crate::metrics::METRICS;
use crate::prompt::{PromptBuilder, ShipmentRecord, TemplateError};
use crate::provider::{
    CompletionClient, ErrorClass, ProviderError, RetryPolicy, SendFailure, Sleeper, TokioSleeper,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Lifecycle of a batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    Unstarted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchState::Unstarted => "unstarted",
            BatchState::Running => "running",
            BatchState::Completed => "completed",
            BatchState::Failed => "failed",
            BatchState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Cooperative cancellation, checked between rows
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Settings the runner needs, taken from [`Config`]
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub model: String,
    pub template_id: String,
    pub checkpoint_interval: usize,
    pub scan_history_column: String,
    pub id_column: String,
    pub carrier_column: String,
    pub window: ContextWindowConfig,
    pub share_context: bool,
    pub compact_on_finish: bool,
}

impl BatchSettings {
    pub fn from_config(config: &Config) -> Self {
        let pipeline = &config.pipeline;
        Self {
            model: pipeline.model.clone(),
            template_id: pipeline.prompt_template_id.clone(),
            checkpoint_interval: pipeline.checkpoint_interval,
            scan_history_column: pipeline.scan_history_column.clone(),
            id_column: pipeline.id_column.clone(),
            carrier_column: pipeline.carrier_column.clone(),
            window: config.context_window(),
            share_context: pipeline.share_context,
            compact_on_finish: pipeline.compact_on_finish,
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Summary of a finished (or cancelled) run
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub state: BatchState,
    pub total_rows: usize,
    /// Rows classified in this run
    pub classified: usize,
    /// Rows recorded with the error status in this run
    pub errors: usize,
    /// Rows reused from the checkpoint
    pub resumed: usize,
    pub token_input: usize,
    pub token_output: usize,
    pub estimated_cost: f64,
    pub context_resets: usize,
    /// One record per processed row, in table order
    pub records: Vec<PredictionRecord>,
    /// Input columns followed by the prediction columns
    pub output: Table,
}

/// Drives a batch through prompt building, completion and checkpointing
pub struct BatchRunner {
    settings: BatchSettings,
    builder: Arc<PromptBuilder>,
    client: Arc<CompletionClient>,
    checkpoint: Arc<dyn CheckpointStore>,
    accountant: Arc<TokenAccountant>,
    pricing: PricingTable,
    flush_policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancelFlag,
    state: BatchState,
}

impl BatchRunner {
    pub fn new(
        settings: BatchSettings,
        builder: Arc<PromptBuilder>,
        client: Arc<CompletionClient>,
        checkpoint: Arc<dyn CheckpointStore>,
    ) -> Self {
        let flush_policy = client.policy().clone();
        Self {
            settings,
            builder,
            client,
            checkpoint,
            accountant: Arc::new(TokenAccountant::new()),
            pricing: PricingTable::default(),
            flush_policy,
            sleeper: Arc::new(TokioSleeper),
            cancel: CancelFlag::new(),
            state: BatchState::Unstarted,
        }
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_accountant(mut self, accountant: Arc<TokenAccountant>) -> Self {
        self.accountant = accountant;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Retry schedule and sleeper for checkpoint flushes
    pub fn with_flush_retry(mut self, policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        self.flush_policy = policy;
        self.sleeper = sleeper;
        self
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Process every row of `input`.
    ///
    /// Returns an error for pre-flight configuration problems, permanent
    /// provider failures and checkpoint writes that keep failing. Records
    /// computed before a failure are flushed first.
    pub async fn run(&mut self, input: &Table) -> Result<BatchReport> {
        if self.state != BatchState::Unstarted {
            return Err(PipelineError::Internal(format!(
                "batch runner already used (state: {})",
                self.state
            )));
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("batch_run", run_id = %run_id, model = %self.settings.model);
        let result = self.execute(run_id, input).instrument(span).await;
        if result.is_err() {
            self.state = BatchState::Failed;
        }
        result
    }

    async fn execute(&mut self, run_id: Uuid, input: &Table) -> Result<BatchReport> {
        let mut window = self.preflight(input)?;
        let mut resume: HashMap<usize, PredictionRecord> = self
            .checkpoint
            .load()
            .await?
            .into_iter()
            .map(|record| (record.row_index, record))
            .collect();

        self.state = BatchState::Running;
        info!(rows = input.len(), checkpointed = resume.len(), "Starting batch");

        let mut report = BatchReport {
            run_id,
            state: BatchState::Running,
            total_rows: input.len(),
            classified: 0,
            errors: 0,
            resumed: 0,
            token_input: 0,
            token_output: 0,
            estimated_cost: 0.0,
            context_resets: 0,
            records: Vec::with_capacity(input.len()),
            output: Table::default(),
        };
        let mut buffer: Vec<PredictionRecord> = Vec::new();

        for (row_index, row) in input.rows().iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(row = row_index, "Cancellation requested, stopping before row");
                self.flush(&mut buffer).await?;
                self.state = BatchState::Cancelled;
                return Ok(self.finish(report, input, &window));
            }

            let input_text = cell_text(row, &self.settings.scan_history_column).unwrap_or_default();

            if let Some(previous) = resume.remove(&row_index) {
                if previous.matches_input(&input_text) {
                    debug!(row = row_index, "Reusing checkpointed prediction");
                    report.resumed += 1;
                    METRICS.record_row("resumed");
                    report.records.push(previous);
                    continue;
                }
                warn!(row = row_index, "Checkpointed input differs from table, reprocessing row");
            }

            let record = match self.process_row(row_index, row, input_text, &mut window).await {
                Ok(record) => record,
                Err(err) => {
                    error!(row = row_index, "Aborting batch: {}", err);
                    self.flush(&mut buffer).await?;
                    return Err(PipelineError::Provider(err));
                }
            };

            if record.is_error() {
                report.errors += 1;
            } else {
                report.classified += 1;
            }
            report.records.push(record.clone());
            buffer.push(record);

            if buffer.len() >= self.settings.checkpoint_interval {
                self.flush(&mut buffer).await?;
            }
        }

        self.flush(&mut buffer).await?;
        self.state = BatchState::Completed;

        if self.settings.compact_on_finish {
            if let Err(e) = self.checkpoint.compact().await {
                warn!("Checkpoint compaction failed: {}", e);
            }
        }

        Ok(self.finish(report, input, &window))
    }

    /// Fatal checks before any row is touched
    fn preflight(&self, input: &Table) -> Result<ContextWindow> {
        let column = &self.settings.scan_history_column;
        if !input.has_column(column) {
            return Err(PipelineError::configuration(format!(
                "input table has no scan history column '{}'",
                column
            )));
        }

        let system = self
            .builder
            .system_prompt(&self.settings.template_id)
            .map_err(|e| match &e {
                TemplateError::NotFound(_) => {
                    let available = self
                        .builder
                        .available_templates()
                        .map(|ids| ids.join(", "))
                        .unwrap_or_else(|err| format!("unavailable ({})", err));
                    PipelineError::configuration(format!("{} (available: {})", e, available))
                }
                _ => PipelineError::configuration(e.to_string()),
            })?;

        let estimator = self.accountant.estimator_for(&self.settings.model);
        ContextWindow::new(&*system, self.settings.window.clone(), estimator)
            .map_err(|e| PipelineError::configuration(e.to_string()))
    }

    /// Classify one row.
    ///
    /// Every outcome short of a permanent provider failure becomes a record.
    async fn process_row(
        &self,
        row_index: usize,
        row: &Row,
        input_text: String,
        window: &mut ContextWindow,
    ) -> std::result::Result<PredictionRecord, ProviderError> {
        let shipment = ShipmentRecord::from_cell(
            cell_text(row, &self.settings.id_column),
            cell_text(row, &self.settings.carrier_column),
            Some(&input_text),
        );

        if !shipment.has_events() {
            debug!(row = row_index, "Empty scan history");
            METRICS.record_row("empty");
            return Ok(PredictionRecord::failure(row_index, input_text, "empty scan history"));
        }

        let prompt = match self.builder.build(&self.settings.template_id, &shipment) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(row = row_index, "Prompt build failed: {}", e);
                METRICS.record_row("error");
                return Ok(PredictionRecord::failure(row_index, input_text, e.to_string()));
            }
        };

        let messages = if self.settings.share_context {
            if window.would_exceed(&prompt.user.content) {
                debug!(row = row_index, token_count = window.token_count(), "Context budget reached");
                window.reset();
            }
            let mut messages = window.get_prompt();
            messages.push(prompt.user.clone());
            messages
        } else {
            prompt.messages().to_vec()
        };

        match self.client.send(&messages, &self.settings.model).await {
            Ok(completion) => {
                let status = extract_status(&completion.text);
                let catalog = self.builder.catalog();
                if !catalog.is_empty() && !catalog.contains(&status) {
                    warn!(row = row_index, status = %status, "Predicted status is not in the catalog");
                }
                if self.settings.share_context {
                    window.add(MessageRole::User, prompt.user.content);
                    window.add(MessageRole::Assistant, completion.text);
                }
                METRICS.record_row("success");
                debug!(row = row_index, status = %status, "Row classified");
                Ok(PredictionRecord::success(
                    row_index,
                    input_text,
                    status,
                    completion.token_input,
                    completion.token_output,
                ))
            }
            Err(SendFailure::Permanent(err)) => Err(err),
            Err(failure) => {
                warn!(row = row_index, "Row failed: {}", failure);
                METRICS.record_row("error");
                Ok(PredictionRecord::failure(row_index, input_text, failure.to_string()))
            }
        }
    }

    /// Write buffered records, retrying before giving up the run
    async fn flush(&self, buffer: &mut Vec<PredictionRecord>) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }

        let records = buffer.as_slice();
        let outcome = self
            .flush_policy
            .run(
                "checkpoint_flush",
                self.sleeper.as_ref(),
                &|_: &PipelineError| ErrorClass::Transient,
                |_| self.checkpoint.append(records),
            )
            .await;

        match outcome {
            Ok(()) => {
                METRICS.record_flush(true);
                info!(records = buffer.len(), "Checkpoint flushed");
                buffer.clear();
                Ok(())
            }
            Err(failure) => {
                METRICS.record_flush(false);
                Err(PipelineError::persistence(format!(
                    "checkpoint flush failed after {} attempts: {}",
                    failure.attempts(),
                    failure.error()
                )))
            }
        }
    }

    fn finish(&self, mut report: BatchReport, input: &Table, window: &ContextWindow) -> BatchReport {
        report.state = self.state;
        report.context_resets = window.resets();

        let pricing = self.pricing.pricing_for(&self.settings.model);
        let mut output = Table::default();
        for record in &report.records {
            report.token_input += record.token_input;
            report.token_output += record.token_output;
            report.estimated_cost += record.estimated_cost(pricing);

            let mut row = input.rows().get(record.row_index).cloned().unwrap_or_default();
            row.extend(record.output_columns(pricing));
            output.push(row);
        }
        report.output = output;

        info!(
            state = %report.state,
            rows = report.records.len(),
            classified = report.classified,
            errors = report.errors,
            resumed = report.resumed,
            token_input = report.token_input,
            token_output = report.token_output,
            "Batch finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::checkpoint::InMemoryCheckpointStore;
    use crate::prompt::{InMemoryTemplateStore, PromptTemplate, StatusCatalog};
    use crate::provider::retry::tests::RecordingSleeper;
    use crate::provider::{Completion, CompletionProvider, CompletionRequest, TokenUsage};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers with the last scan description of the user message
    struct EchoProvider {
        requests: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl CompletionProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, request: &CompletionRequest) -> std::result::Result<Completion, ProviderError> {
            self.requests.lock().unwrap().push(request.clone());
            let user = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            let last = user.lines().last().unwrap_or_default();
            let status = last.rsplit(") ").next().unwrap_or(last).to_string();
            Ok(Completion::new(
                status,
                Some(TokenUsage {
                    prompt_tokens: 40,
                    completion_tokens: 2,
                }),
            ))
        }
    }

    fn runner(
        settings: BatchSettings,
        provider: Arc<dyn CompletionProvider>,
        checkpoint: Arc<InMemoryCheckpointStore>,
    ) -> BatchRunner {
        let store = InMemoryTemplateStore::new()
            .with_template("shipment_status", PromptTemplate::new("Classify the shipment."));
        let catalog = StatusCatalog::new(vec!["Collected".into(), "Delivered".into()]);
        let builder = Arc::new(PromptBuilder::new(Arc::new(store), catalog, 30));
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = Arc::new(
            CompletionClient::new(provider, RetryPolicy::new(3, Duration::from_millis(1)))
                .with_sleeper(sleeper.clone()),
        );
        BatchRunner::new(settings, builder, client, checkpoint)
            .with_flush_retry(RetryPolicy::new(2, Duration::from_millis(1)), sleeper)
    }

    fn table(cells: &[Value]) -> Table {
        let mut table = Table::new(vec!["ScanGroups".to_string()]);
        for cell in cells {
            table.push(Row::from_iter([("ScanGroups".to_string(), cell.clone())]));
        }
        table
    }

    fn echo() -> Arc<EchoProvider> {
        Arc::new(EchoProvider {
            requests: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_scenario_empty_real_null() {
        let settings = BatchSettings {
            checkpoint_interval: 2,
            ..BatchSettings::default()
        };
        let checkpoint = Arc::new(InMemoryCheckpointStore::new());
        let mut runner = runner(settings, echo(), checkpoint.clone());

        let input = table(&[json!(""), json!("(t1) Collected,(t2) Delivered"), Value::Null]);
        let report = runner.run(&input).await.unwrap();

        assert_eq!(report.state, BatchState::Completed);
        assert_eq!(runner.state(), BatchState::Completed);
        assert_eq!(report.output.len(), 3);
        assert_eq!(report.records[0].predicted_status, "Error");
        assert_eq!(report.records[0].token_input, 0);
        assert_eq!(report.records[1].predicted_status, "Delivered");
        assert_eq!(report.records[2].predicted_status, "Error");
        assert_eq!(checkpoint.flush_sizes(), vec![2, 1]);
        assert_eq!(report.output.rows()[1]["Predicted_Status"], json!("Delivered"));
        assert_eq!(report.output.rows()[1]["Total_Tokens"], json!(42));
    }

    #[tokio::test]
    async fn test_missing_column_fails_before_any_row() {
        let provider = echo();
        let checkpoint = Arc::new(InMemoryCheckpointStore::new());
        let mut runner = runner(BatchSettings::default(), provider.clone(), checkpoint.clone());

        let mut input = Table::new(vec!["other".to_string()]);
        input.push(Row::from_iter([("other".to_string(), json!("x"))]));

        let err = runner.run(&input).await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(runner.state(), BatchState::Failed);
        assert!(provider.requests.lock().unwrap().is_empty());
        assert!(checkpoint.entries().is_empty());
    }

    #[tokio::test]
    async fn test_missing_template_is_configuration_error() {
        let settings = BatchSettings {
            template_id: "unknown".to_string(),
            ..BatchSettings::default()
        };
        let mut runner = runner(settings, echo(), Arc::new(InMemoryCheckpointStore::new()));
        let err = runner.run(&table(&[json!("(t1) x")])).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("available: shipment_status"), "{}", err);
    }

    #[tokio::test]
    async fn test_system_prompt_over_budget_is_configuration_error() {
        let settings = BatchSettings {
            window: ContextWindowConfig {
                token_budget: 3,
                per_message_overhead: 4,
            },
            ..BatchSettings::default()
        };
        let mut runner = runner(settings, echo(), Arc::new(InMemoryCheckpointStore::new()));
        let err = runner.run(&table(&[json!("(t1) x")])).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_runner_cannot_be_reused() {
        let mut runner = runner(BatchSettings::default(), echo(), Arc::new(InMemoryCheckpointStore::new()));
        runner.run(&table(&[json!("(t1) Delivered")])).await.unwrap();
        assert!(runner.run(&table(&[json!("(t1) Delivered")])).await.is_err());
    }

    #[tokio::test]
    async fn test_context_is_shared_then_reset_under_budget() {
        let provider = echo();
        let settings = BatchSettings {
            window: ContextWindowConfig {
                token_budget: 200,
                per_message_overhead: 4,
            },
            ..BatchSettings::default()
        };
        let mut runner = runner(settings, provider.clone(), Arc::new(InMemoryCheckpointStore::new()));

        let cells: Vec<Value> = (0..12)
            .map(|i| json!(format!("(2024-01-01T00:00:{:02}) Parcel scanned at depot {}", i, i)))
            .collect();
        let report = runner.run(&table(&cells)).await.unwrap();

        assert_eq!(report.classified, 12);
        assert!(report.context_resets > 0);
        let requests = provider.requests.lock().unwrap();
        assert!(requests.iter().any(|r| r.messages.len() > 2));
        assert!(requests.iter().all(|r| r.messages[0].role == MessageRole::System));
    }

    #[tokio::test]
    async fn test_cancel_before_first_row() {
        let checkpoint = Arc::new(InMemoryCheckpointStore::new());
        let mut runner = runner(BatchSettings::default(), echo(), checkpoint.clone());
        runner.cancel_flag().cancel();

        let report = runner.run(&table(&[json!("(t1) Delivered")])).await.unwrap();
        assert_eq!(report.state, BatchState::Cancelled);
        assert!(report.records.is_empty());
        assert!(checkpoint.flush_sizes().is_empty());
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unknown_model_pricing_warns_once() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let settings = BatchSettings {
            model: "mystery-model".to_string(),
            ..BatchSettings::default()
        };
        let mut runner = runner(settings, echo(), Arc::new(InMemoryCheckpointStore::new()));
        let cells: Vec<Value> = (0..4).map(|i| json!(format!("(t{}) Delivered", i))).collect();
        let report = runner.run(&table(&cells)).await.unwrap();

        assert_eq!(report.classified, 4);
        assert!(report.estimated_cost > 0.0);
        let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text.matches("No pricing for model").count(), 1, "{}", text);
    }

    /// Echoes like [`EchoProvider`] and raises the cancel flag on call `cancel_on`
    struct CancellingProvider {
        inner: EchoProvider,
        cancel: CancelFlag,
        cancel_on: usize,
    }

    #[async_trait]
    impl CompletionProvider for CancellingProvider {
        fn name(&self) -> &str {
            "cancelling"
        }

        async fn complete(&self, request: &CompletionRequest) -> std::result::Result<Completion, ProviderError> {
            let reply = self.inner.complete(request).await;
            if self.inner.requests.lock().unwrap().len() == self.cancel_on {
                self.cancel.cancel();
            }
            reply
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_flushes_computed_rows() {
        let cancel = CancelFlag::new();
        let provider = Arc::new(CancellingProvider {
            inner: EchoProvider {
                requests: Mutex::new(Vec::new()),
            },
            cancel: cancel.clone(),
            cancel_on: 3,
        });
        let settings = BatchSettings {
            checkpoint_interval: 10,
            ..BatchSettings::default()
        };
        let checkpoint = Arc::new(InMemoryCheckpointStore::new());
        let mut runner = runner(settings, provider.clone(), checkpoint.clone()).with_cancel_flag(cancel);

        let cells: Vec<Value> = (0..8).map(|i| json!(format!("(t{}) Collected", i))).collect();
        let report = runner.run(&table(&cells)).await.unwrap();

        assert_eq!(report.state, BatchState::Cancelled);
        assert_eq!(runner.state(), BatchState::Cancelled);
        assert_eq!(report.records.len(), 3);
        assert_eq!(provider.inner.requests.lock().unwrap().len(), 3);
        assert_eq!(checkpoint.flush_sizes(), vec![3]);
        let rows: Vec<usize> = checkpoint.entries().iter().map(|r| r.row_index).collect();
        assert_eq!(rows, vec![0, 1, 2]);
    }
}

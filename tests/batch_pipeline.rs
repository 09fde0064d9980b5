//! End-to-end batch runs against scripted providers

use async_trait::async_trait;
use serde_json::{json, Value};
use shipment_classifier::batch::{
    BatchRunner, BatchSettings, BatchState, CheckpointStore, JsonlCheckpointStore, JsonlTableStore,
    PredictionRecord, Row, Table, TableStore, OUTPUT_COLUMNS,
};
use shipment_classifier::prompt::{InMemoryTemplateStore, PromptBuilder, PromptTemplate, StatusCatalog};
use shipment_classifier::provider::{
    Completion, CompletionClient, CompletionProvider, CompletionRequest, ProviderError, RetryPolicy, Sleeper,
    TokenUsage,
};
use shipment_classifier::PipelineError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records requested delays instead of waiting
#[derive(Default)]
struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

type Script = dyn Fn(usize, &CompletionRequest) -> Option<Result<Completion, ProviderError>> + Send + Sync;

/// Provider driven by a closure of (call number, request).
///
/// Returning `None` never answers, simulating a process that dies mid-call.
struct ScriptedProvider {
    calls: AtomicUsize,
    script: Box<Script>,
}

impl ScriptedProvider {
    fn new(
        script: impl Fn(usize, &CompletionRequest) -> Option<Result<Completion, ProviderError>> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Box::new(script),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match (self.script)(call, request) {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

fn reply(status: &str) -> Option<Result<Completion, ProviderError>> {
    Some(Ok(Completion::new(
        status,
        Some(TokenUsage {
            prompt_tokens: 50,
            completion_tokens: 3,
        }),
    )))
}

fn rate_limited() -> Option<Result<Completion, ProviderError>> {
    Some(Err(ProviderError::RateLimited { retry_after: None }))
}

fn runner(
    settings: BatchSettings,
    provider: Arc<ScriptedProvider>,
    checkpoint: Arc<dyn CheckpointStore>,
    sleeper: Arc<RecordingSleeper>,
) -> BatchRunner {
    let templates = InMemoryTemplateStore::new().with_template(
        "shipment_status",
        PromptTemplate::new("Classify the latest status of the shipment.")
            .with_rules(vec!["Answer with one label only.".to_string()]),
    );
    let catalog = StatusCatalog::new(vec!["Collected".into(), "In Transit".into(), "Delivered".into()]);
    let builder = Arc::new(PromptBuilder::new(Arc::new(templates), catalog, 30));
    let client = Arc::new(
        CompletionClient::new(provider, RetryPolicy::new(3, Duration::from_millis(100)))
            .with_sleeper(sleeper.clone()),
    );
    BatchRunner::new(settings, builder, client, checkpoint)
        .with_flush_retry(RetryPolicy::new(3, Duration::from_millis(10)), sleeper)
}

fn table(cells: impl IntoIterator<Item = Value>) -> Table {
    let mut table = Table::new(vec!["tracking_number".to_string(), "ScanGroups".to_string()]);
    for (i, cell) in cells.into_iter().enumerate() {
        table.push(Row::from_iter([
            ("tracking_number".to_string(), json!(format!("TRK{:04}", i))),
            ("ScanGroups".to_string(), cell),
        ]));
    }
    table
}

fn scans(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| json!(format!("(2024-09-03T17:36:51) Shipment manifested,(2024-09-05T15:39:{:02}) Collected", i % 60)))
        .collect()
}

#[tokio::test]
async fn empty_real_and_null_rows_yield_three_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_path = dir.path().join("checkpoint.jsonl");
    let checkpoint = Arc::new(JsonlCheckpointStore::new(&checkpoint_path));
    let provider = ScriptedProvider::new(|_, _| reply("Delivered"));
    let settings = BatchSettings {
        checkpoint_interval: 2,
        compact_on_finish: false,
        ..BatchSettings::default()
    };
    let mut runner = runner(settings, provider.clone(), checkpoint.clone(), Arc::default());

    let input = table([json!(""), json!("(t1) Collected,(t2) Delivered"), Value::Null]);
    let report = runner.run(&input).await.unwrap();

    assert_eq!(report.state, BatchState::Completed);
    assert_eq!(provider.calls(), 1);
    assert_eq!(report.output.len(), 3);

    let statuses: Vec<&str> = report.records.iter().map(|r| r.predicted_status.as_str()).collect();
    assert_eq!(statuses, ["Error", "Delivered", "Error"]);
    assert_eq!(report.records[0].token_input, 0);
    assert_eq!(report.records[2].token_input, 0);

    // one flush after row 2, one final flush for row 3
    let log = std::fs::read_to_string(&checkpoint_path).unwrap();
    assert_eq!(log.lines().count(), 3);

    let out_path = dir.path().join("predictions.jsonl");
    JsonlTableStore::new(&out_path).write(&report.output).await.unwrap();
    let written = JsonlTableStore::new(&out_path).read().await.unwrap();
    assert_eq!(written.len(), 3);
    assert_eq!(written.columns()[..2], ["tracking_number", "ScanGroups"]);
    assert_eq!(written.columns()[2..], OUTPUT_COLUMNS);
    assert_eq!(written.rows()[1]["Predicted_Status"], json!("Delivered"));
    assert_eq!(written.rows()[1]["Total_Tokens"], json!(53));
}

#[tokio::test]
async fn interrupted_run_resumes_from_flushed_records() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_path = dir.path().join("checkpoint.jsonl");
    let input = table(scans(120));
    let settings = BatchSettings {
        checkpoint_interval: 50,
        ..BatchSettings::default()
    };

    // first run dies while classifying row 101
    let stalled = Arc::new(tokio::sync::Notify::new());
    let signal = stalled.clone();
    let crashing = ScriptedProvider::new(move |call, _| {
        if call <= 100 {
            reply("Collected")
        } else {
            signal.notify_one();
            None
        }
    });
    let mut first = runner(
        settings.clone(),
        crashing.clone(),
        Arc::new(JsonlCheckpointStore::new(&checkpoint_path)),
        Arc::default(),
    );
    tokio::select! {
        _ = first.run(&input) => panic!("first run should never finish"),
        _ = stalled.notified() => {}
    }
    drop(first);
    assert_eq!(crashing.calls(), 101);

    let recovered = JsonlCheckpointStore::new(&checkpoint_path).load().await.unwrap();
    assert_eq!(recovered.len(), 100);
    let rows: Vec<usize> = recovered.iter().map(|r| r.row_index).collect();
    assert_eq!(rows, (0..100).collect::<Vec<_>>());

    // second run reuses the 100 records and classifies the rest
    let healthy = ScriptedProvider::new(|_, _| reply("Delivered"));
    let checkpoint = Arc::new(JsonlCheckpointStore::new(&checkpoint_path));
    let mut second = runner(settings, healthy.clone(), checkpoint.clone(), Arc::default());
    let report = second.run(&input).await.unwrap();

    assert_eq!(healthy.calls(), 20);
    assert_eq!(report.resumed, 100);
    assert_eq!(report.classified, 20);
    assert_eq!(report.output.len(), 120);
    assert_eq!(report.records[99].predicted_status, "Collected");
    assert_eq!(report.records[100].predicted_status, "Delivered");

    let all = checkpoint.load().await.unwrap();
    assert_eq!(all.len(), 120);
    let log = std::fs::read_to_string(&checkpoint_path).unwrap();
    assert_eq!(log.lines().count(), 120, "compaction leaves one entry per row");
}

#[tokio::test]
async fn changed_input_is_reprocessed_on_resume() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = Arc::new(JsonlCheckpointStore::new(dir.path().join("checkpoint.jsonl")));
    checkpoint
        .append(&[PredictionRecord::success(0, "(t0) stale history", "Collected", 10, 1)])
        .await
        .unwrap();

    let provider = ScriptedProvider::new(|_, _| reply("Delivered"));
    let mut runner = runner(BatchSettings::default(), provider.clone(), checkpoint, Arc::default());
    let report = runner.run(&table([json!("(t0) fresh history")])).await.unwrap();

    assert_eq!(provider.calls(), 1);
    assert_eq!(report.resumed, 0);
    assert_eq!(report.records[0].predicted_status, "Delivered");
}

#[tokio::test]
async fn rate_limited_twice_then_success_records_once() {
    let provider = ScriptedProvider::new(|call, _| if call <= 2 { rate_limited() } else { reply("In Transit") });
    let checkpoint = Arc::new(shipment_classifier::batch::InMemoryCheckpointStore::new());
    let sleeper = Arc::new(RecordingSleeper::default());
    let mut runner = runner(BatchSettings::default(), provider.clone(), checkpoint.clone(), sleeper.clone());

    let report = runner.run(&table(scans(1))).await.unwrap();

    assert_eq!(provider.calls(), 3);
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].predicted_status, "In Transit");
    assert_eq!(report.records[0].token_input, 50);
    assert_eq!(checkpoint.entries().len(), 1);
    assert_eq!(
        *sleeper.delays.lock().unwrap(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
}

#[tokio::test]
async fn exhausted_retries_become_an_error_row() {
    let provider = ScriptedProvider::new(|call, _| if call <= 3 { rate_limited() } else { reply("Delivered") });
    let sleeper = Arc::new(RecordingSleeper::default());
    let mut runner = runner(
        BatchSettings::default(),
        provider.clone(),
        Arc::new(shipment_classifier::batch::InMemoryCheckpointStore::new()),
        sleeper.clone(),
    );

    let report = runner.run(&table(scans(2))).await.unwrap();

    assert_eq!(provider.calls(), 4);
    assert_eq!(report.records[0].predicted_status, "Error");
    assert!(report.records[0].error.as_deref().unwrap().contains("3 attempts"));
    assert_eq!(report.records[1].predicted_status, "Delivered");
    assert_eq!(report.errors, 1);

    let delays = sleeper.delays.lock().unwrap().clone();
    assert_eq!(delays.len(), 2);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn invalid_request_skips_only_that_row() {
    let provider = ScriptedProvider::new(|call, _| {
        if call == 1 {
            Some(Err(ProviderError::InvalidRequest("context length exceeded".into())))
        } else {
            reply("Delivered")
        }
    });
    let mut runner = runner(
        BatchSettings::default(),
        provider.clone(),
        Arc::new(shipment_classifier::batch::InMemoryCheckpointStore::new()),
        Arc::default(),
    );

    let report = runner.run(&table(scans(2))).await.unwrap();
    assert_eq!(provider.calls(), 2);
    assert_eq!(report.records[0].predicted_status, "Error");
    assert_eq!(report.records[1].predicted_status, "Delivered");
}

#[tokio::test]
async fn authentication_failure_aborts_after_flushing() {
    let provider = ScriptedProvider::new(|call, _| {
        if call == 1 {
            reply("Collected")
        } else {
            Some(Err(ProviderError::Authentication("invalid api key".into())))
        }
    });
    let checkpoint = Arc::new(shipment_classifier::batch::InMemoryCheckpointStore::new());
    let mut runner = runner(BatchSettings::default(), provider.clone(), checkpoint.clone(), Arc::default());

    let err = runner.run(&table(scans(5))).await.unwrap_err();

    assert!(matches!(err, PipelineError::Provider(ProviderError::Authentication(_))));
    assert_eq!(runner.state(), BatchState::Failed);
    assert_eq!(provider.calls(), 2);
    assert_eq!(checkpoint.entries().len(), 1);
}

#[tokio::test]
async fn missing_scan_column_is_a_configuration_error() {
    let provider = ScriptedProvider::new(|_, _| reply("Delivered"));
    let mut runner = runner(
        BatchSettings::default(),
        provider.clone(),
        Arc::new(shipment_classifier::batch::InMemoryCheckpointStore::new()),
        Arc::default(),
    );

    let mut input = Table::new(vec!["tracking_number".to_string()]);
    input.push(Row::from_iter([("tracking_number".to_string(), json!("TRK1"))]));

    let err = runner.run(&input).await.unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(provider.calls(), 0);
}

/// Checkpoint store whose writes always fail
struct BrokenCheckpointStore {
    attempts: AtomicUsize,
}

#[async_trait]
impl CheckpointStore for BrokenCheckpointStore {
    async fn load(&self) -> shipment_classifier::Result<Vec<PredictionRecord>> {
        Ok(Vec::new())
    }

    async fn append(&self, _records: &[PredictionRecord]) -> shipment_classifier::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
    }

    async fn compact(&self) -> shipment_classifier::Result<usize> {
        Ok(0)
    }
}

#[tokio::test]
async fn failing_flush_is_retried_then_stops_the_run() {
    let store = Arc::new(BrokenCheckpointStore {
        attempts: AtomicUsize::new(0),
    });
    let provider = ScriptedProvider::new(|_, _| reply("Delivered"));
    let settings = BatchSettings {
        checkpoint_interval: 2,
        ..BatchSettings::default()
    };
    let mut runner = runner(settings, provider.clone(), store.clone(), Arc::default());

    let err = runner.run(&table(scans(5))).await.unwrap_err();

    assert!(matches!(err, PipelineError::Persistence(_)));
    assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(provider.calls(), 2);
    assert_eq!(runner.state(), BatchState::Failed);
}

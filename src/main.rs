use anyhow::Context;
use clap::Parser;
use shipment_classifier::batch::{
    BatchRunner, BatchSettings, BatchState, CancelFlag, JsonlCheckpointStore, JsonlTableStore, TableStore,
};
use shipment_classifier::config::Config;
use shipment_classifier::context::TokenAccountant;
use shipment_classifier::metrics::METRICS;
use shipment_classifier::prompt::{FileTemplateStore, PromptBuilder, StatusCatalog};
use shipment_classifier::provider::{CompletionClient, OpenAiProvider};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shipment-classifier")]
#[command(about = "Classify shipment scan histories with an LLM, with resumable checkpoints")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(long, short, env = "CLASSIFIER_CONFIG")]
    config: Option<PathBuf>,

    /// Input table (JSON Lines); overrides paths.input
    #[arg(long, short)]
    input: Option<PathBuf>,

    /// Output table (JSON Lines); overrides paths.output
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Checkpoint log; overrides paths.checkpoint
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Model id; overrides pipeline.model
    #[arg(long)]
    model: Option<String>,

    /// Print Prometheus metrics after the run
    #[arg(long, default_value = "false")]
    metrics: bool,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(input) = cli.input {
        config.paths.input = Some(input);
    }
    if let Some(output) = cli.output {
        config.paths.output = output;
    }
    if let Some(checkpoint) = cli.checkpoint {
        config.paths.checkpoint = checkpoint;
    }
    if let Some(model) = cli.model {
        config.pipeline.model = model;
    }
    config.validate()?;
    init_tracing(&config);
    match &cli.config {
        Some(path) => info!(path = %path.display(), model = %config.pipeline.model, "Configuration loaded"),
        None => info!(model = %config.pipeline.model, "Configuration loaded from environment"),
    }

    let input_path = config
        .paths
        .input
        .clone()
        .context("No input table given (use --input or paths.input)")?;
    let input = JsonlTableStore::new(&input_path).read().await?;
    info!(path = %input_path.display(), rows = input.len(), "Loaded input table");

    let catalog = match &config.paths.status_catalog {
        Some(path) => StatusCatalog::from_file(path)?,
        None => StatusCatalog::default(),
    };
    let templates = Arc::new(FileTemplateStore::new(&config.paths.template_dir));
    let builder = Arc::new(PromptBuilder::new(templates, catalog, config.pipeline.max_scan_events));

    let accountant = Arc::new(TokenAccountant::new());
    let provider = Arc::new(OpenAiProvider::from_config(&config.provider)?);
    let client = Arc::new(
        CompletionClient::new(provider, config.retry_policy())
            .with_accountant(accountant.clone())
            .with_temperature(config.provider.temperature)
            .with_max_output_tokens(config.provider.max_output_tokens),
    );
    let checkpoint = Arc::new(JsonlCheckpointStore::new(&config.paths.checkpoint));

    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing current row");
            on_signal.cancel();
        }
    });

    let mut runner = BatchRunner::new(BatchSettings::from_config(&config), builder, client, checkpoint)
        .with_pricing(config.pricing.clone())
        .with_accountant(accountant)
        .with_cancel_flag(cancel);

    let report = runner.run(&input).await?;

    match report.state {
        BatchState::Completed => {
            JsonlTableStore::new(&config.paths.output)
                .write(&report.output)
                .await
                .context("Failed to write output table")?;
            info!(path = %config.paths.output.display(), "Output written");
        }
        _ => warn!(
            state = %report.state,
            checkpoint = %config.paths.checkpoint.display(),
            "Run stopped early; rerun to resume from the checkpoint"
        ),
    }

    println!(
        "{} rows: {} classified, {} errors, {} resumed | tokens in {} out {} | est. cost ${:.4}",
        report.total_rows,
        report.classified,
        report.errors,
        report.resumed,
        report.token_input,
        report.token_output,
        report.estimated_cost
    );

    if cli.metrics {
        println!("{}", METRICS.export_prometheus());
    }

    Ok(())
}

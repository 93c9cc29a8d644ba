//! `lexcascade` -- run one analysis stage over an NDJSON section stream.
//!
//! Reads records from `--in`, routes each through the configured LLM
//! cascade, and writes structured results to `--out`. Per-record failures
//! are logged and skipped; the process exits non-zero only on fatal
//! configuration errors.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use lexcascade::{
    build_strategy, dispatch, CascadeConfig, DispatchOptions, HttpModelClient, ModelRegistry,
    SectionCodec, StrategyKind, UsageStats,
};

/// LLM cascade runner for statute-section analysis.
#[derive(Parser)]
#[command(name = "lexcascade", about = "LLM provider cascade for section analysis", version)]
struct Cli {
    /// Input NDJSON path, one record per line.
    #[arg(long = "in", value_name = "PATH")]
    input: PathBuf,

    /// Output NDJSON path for structured results.
    #[arg(long = "out", value_name = "PATH")]
    output: PathBuf,

    /// Stop after this many records.
    #[arg(long, value_name = "N")]
    limit: Option<usize>,

    /// Worker pool size.
    #[arg(long, value_name = "N", default_value_t = 1)]
    workers: usize,

    /// Round-robin across models within a tier.
    #[arg(long)]
    parallel: bool,

    /// Cascade strategy: error_driven or rate_limited.
    /// Falls back to $LLM_CASCADE_STRATEGY, then to a worker-count default.
    #[arg(long = "cascade-strategy", value_name = "NAME")]
    cascade_strategy: Option<String>,

    /// Backend configuration file (JSON). Uses the built-in registry if omitted.
    #[arg(long, value_name = "PATH")]
    models: Option<PathBuf>,

    /// Enable verbose (debug-level) logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.models {
        Some(path) => CascadeConfig::load(path)?,
        None => CascadeConfig::default(),
    };
    let registry = ModelRegistry::from_config(&config)?;

    let kind = StrategyKind::resolve(
        cli.cascade_strategy.as_deref(),
        std::env::var("LLM_CASCADE_STRATEGY").ok().as_deref(),
        cli.workers,
    )?;

    let client = Arc::new(HttpModelClient::new(config.timeout_secs)?);
    let stats = Arc::new(UsageStats::new());
    let strategy = build_strategy(
        kind,
        &registry,
        client,
        Arc::clone(&stats),
        &config,
        cli.parallel,
    );

    info!(
        strategy = strategy.name(),
        backends = registry.len(),
        workers = cli.workers,
        "starting cascade run"
    );

    let summary = dispatch::run(
        Arc::clone(&strategy),
        Arc::new(SectionCodec),
        &cli.input,
        &cli.output,
        DispatchOptions {
            workers: cli.workers,
            limit: cli.limit,
        },
    )
    .await?;

    eprintln!("{}", stats.report(&strategy.snapshot()));
    info!(
        processed = summary.processed,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "run complete"
    );

    Ok(())
}

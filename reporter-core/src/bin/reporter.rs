//! Reporter daemon binary

use anyhow::Context;
use reporter_core::{
    ChainScanner, Config, ExplorerClient, HttpExplorer, JsonLinesSink, LedgerAggregator,
    LedgerRecorder, MemorySink, Metrics, RocksStore, Runner, StatsRecorder, StatsSink,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Load configuration
    let config = match std::env::var("REPORTER_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .and_then(Config::with_env_overrides)
            .with_context(|| format!("loading configuration from {}", path))?,
        Err(_) => Config::from_env().context("loading configuration from environment")?,
    };

    tracing::info!(
        service = %config.service_name,
        explorer = %config.explorer.url,
        data_dir = ?config.data_dir,
        "Starting Rivine reporter"
    );

    let explorer = Arc::new(HttpExplorer::new(&config.explorer)?);
    // Fail fast when the explorer is unreachable
    explorer
        .get_block(0)
        .await
        .with_context(|| format!("explorer at {} is not reachable", config.explorer.url))?;

    let metrics = Metrics::new()?;
    let shutdown_metrics = metrics.clone();

    let store = Arc::new(RocksStore::open(&config).context("opening balance store")?);
    let ledger = LedgerAggregator::new(store).with_metrics(metrics.clone());

    let sink: Arc<dyn StatsSink> = match &config.stats.output_path {
        Some(path) => Arc::new(
            JsonLinesSink::open(path)
                .await
                .with_context(|| format!("opening stats output {:?}", path))?,
        ),
        None => Arc::new(MemorySink::new()),
    };
    let stats = StatsRecorder::spawn(
        sink,
        config.stats.batch_size,
        Duration::from_secs(config.stats.flush_interval_secs),
    );

    let scanner = ChainScanner::new(explorer)
        .with_backoff(Duration::from_secs(config.scanner.backoff_secs))
        .with_metrics(metrics);

    let runner = Arc::new(
        Runner::new(scanner)
            .with_recorder(Arc::new(LedgerRecorder::new(Arc::new(ledger))))
            .with_recorder(stats)
            .with_start_height(config.start_height),
    );

    let mut task = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run().await }
    });

    let finished = tokio::select! {
        joined = &mut task => Some(joined),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            None
        }
    };

    let joined = match finished {
        Some(joined) => joined,
        None => {
            tracing::info!("Shutting down reporter");
            runner.stop();
            task.await
        }
    };

    match shutdown_metrics.encode_text() {
        Ok(snapshot) => tracing::info!(metrics = %snapshot, "Final metrics"),
        Err(e) => tracing::warn!(error = %e, "Failed to encode metrics"),
    }

    let summary = joined.context("runner task failed")??;
    tracing::info!(
        blocks = summary.blocks,
        last_height = ?summary.last_height,
        "Reporter stopped"
    );
    Ok(())
}

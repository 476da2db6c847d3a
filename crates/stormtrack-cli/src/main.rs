use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use stormtrack_sync::{Pipeline, StormConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Periodic tropical-cyclone advisory archiver.
#[derive(Debug, Parser)]
#[command(name = "stormtrack")]
#[command(about = "Fetches tropical cyclone advisories and appends them to the historical track tables")]
struct Cli {
    /// Mirror every fetched document into the snapshot store for later
    /// replay.
    #[arg(long)]
    save: bool,

    /// Replay a previous run's snapshots instead of hitting the network.
    #[arg(long, conflicts_with = "save")]
    use_saved: bool,

    /// Optional YAML config file; environment variables take precedence.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = StormConfig::load(cli.config.as_deref())?;
    info!(
        feed = %config.feed_url,
        data_dir = %config.data_dir.display(),
        save = cli.save,
        use_saved = cli.use_saved,
        "starting stormtrack"
    );

    let pipeline = Pipeline::from_config(config, cli.save, cli.use_saved)?;
    let summary = pipeline.run_once().await?;

    println!(
        "run complete: run_id={} storms={} observed={} forecast={} skipped={} triggered={}",
        summary.run_id,
        summary.active_storms,
        summary.observed_rows,
        summary.forecast_rows,
        summary.skipped_storms,
        summary.triggered
    );
    Ok(())
}

//! Command-line entry point for running a training job

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tuneforge::JobOrchestrator;

/// Run a fine-tuning job described by a config file
#[derive(Parser)]
#[command(name = "tuneforge", version, about)]
struct Cli {
    /// Path to the job configuration file (YAML, or JSON with a .json extension)
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let outcome = JobOrchestrator::new()
        .run_job(&cli.config)
        .await
        .with_context(|| format!("training job {} failed", cli.config.display()))?;

    info!(
        "Model saved to {} ({} steps, final loss {:.4})",
        outcome.artifact_path.display(),
        outcome.total_steps,
        outcome.final_loss
    );
    if let Some(run_id) = &outcome.run_id {
        info!("Tracked as run {run_id}");
    }
    for warning in &outcome.tracking_warnings {
        tracing::warn!("Tracking warning: {warning}");
    }
    Ok(())
}

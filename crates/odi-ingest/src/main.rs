//! ODI Ingest - complaint release ingestion tool

use anyhow::Result;
use clap::Parser;
use odi_common::logging::{init_logging, LogConfig, LogLevel};
use odi_ingest::{Cli, Pipeline, RunStatus};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("odi-ingest")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;
    let guard = init_logging(&log_config)?;

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            eprintln!("error: {e}");
            std::process::exit(RunStatus::Failed.exit_code());
        },
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current row");
            on_signal.cancel();
        }
    });

    let outcome = match Pipeline::new(config, cancel).run().await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "Run aborted before start");
            eprintln!("error: {e}");
            std::process::exit(RunStatus::Failed.exit_code());
        },
    };

    print!("{}", outcome.manifest.summary_text());
    if let Some(paths) = &outcome.paths {
        println!("Manifest:  {}", paths.manifest.display());
    }

    let code = outcome.exit_code();
    drop(guard);
    std::process::exit(code);
}

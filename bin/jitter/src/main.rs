//! Entrypoint for the `jitter` service.

#![deny(warnings)]
#![deny(missing_docs)]

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use jitter::{config::JitterConfiguration, lifecycle::ServiceLifecycle};
use jitter_app::prelude::*;
use jitter_error::{ErrorContext as _, GenericError};
use tracing::{error, info, level_filters::LevelFilter};

#[derive(Parser)]
#[command(about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    config_path: Option<PathBuf>,

    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,
}

impl Cli {
    /// Gets the configured log level based on the user-supplied verbosity level.
    fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = initialize_logging(Some(cli.log_level())) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(cli).await {
        Ok(()) => info!("jitter stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<(), GenericError> {
    info!("jitter starting...");

    let config = JitterConfiguration::load(cli.config_path.as_deref()).error_context("Failed to load configuration.")?;

    let telemetry = initialize_telemetry(config.metrics_prefix.clone(), config.telemetry_flush_interval())
        .error_context("Failed to initialize telemetry.")?;

    let mut lifecycle = ServiceLifecycle::new(config).with_telemetry(telemetry);
    lifecycle.start().await?;

    lifecycle
        .run_until(async {
            if let Err(e) = wait_for_shutdown_signal().await {
                error!(error = %e, "Failed to wait for shutdown signal. Shutting down.");
            }
        })
        .await
}

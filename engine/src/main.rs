// Pulse activity intelligence engine
// Main entry point for the pulse binary

use clap::Parser;
use pulse_engine::cli::{Cli, Command};
use pulse_engine::config::Config;
use pulse_engine::handlers::{
    handle_activities, handle_ingest, handle_run, handle_start, handle_stats, handle_status,
    handle_stop, OutputFormat,
};
use pulse_engine::telemetry::{self, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // The tracing subscriber is global and can only be installed once, so
    // it waits for the resolved level: --log beats core.log_level, and
    // RUST_LOG beats both inside the filter.
    let log_level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    let log_format: LogFormat = config.core.log_format.parse()?;
    telemetry::init(log_level, log_format)?;

    tracing::info!("Pulse Engine v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Start => {
            tracing::info!("Starting daemon...");
            handle_start(&config, format).await
        }

        Command::Stop => {
            tracing::info!("Stopping daemon...");
            handle_stop(&config, format).await
        }

        Command::Status => handle_status(&config, format).await,

        Command::Run => {
            tracing::info!("Running one batch...");
            handle_run(&config, format).await
        }

        Command::Ingest { file, source } => handle_ingest(file, source, &config, format).await,

        Command::Activities { days, project } => {
            handle_activities(days, project, &config, format).await
        }

        Command::Stats { days } => handle_stats(days, &config, format).await,
    }
}

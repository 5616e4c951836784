//! Alarm Connect Daemon
//!
//! Keeps one connection per configured alarm panel and routes service calls
//! read from stdin to them.

mod config;
mod control;
mod daemon;
mod diagnostics;
mod entries;
mod error_handler;
mod recovery;
mod tcp_client;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use daemon::Daemon;
use diagnostics::Cli;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let cli = Cli::parse();

    // Initialize logging with CLI configuration
    diagnostics::init_logging(&cli).context("Failed to initialize logging")?;

    // Load configuration
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // Handle maintenance commands (non-daemon mode)
    if let Some(command) = &cli.command {
        return diagnostics::handle_diagnostic_command(command, &config);
    }

    info!("Starting alarm-connect daemon...");
    info!("Entries file: {}", config.paths.entries_file.display());

    let mut daemon = Daemon::new(config)
        .await
        .context("Failed to create daemon")?;

    daemon
        .start()
        .await
        .context("Failed to set up panel entries")?;

    // Run daemon
    let result = daemon.run().await;

    // Shutdown
    daemon.shutdown().await?;

    result
}

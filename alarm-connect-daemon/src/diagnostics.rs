//! Diagnostics and Debug Logging
//!
//! Command-line interface, logging setup and the offline maintenance
//! commands that work on the entries file without starting any connection.

use crate::config::Config;
use crate::entries::EntryStore;
use crate::tcp_client::LinkTarget;
use alarm_connect_core::config::panel_id_from;
use alarm_connect_core::{ConfigEntry, Migrator, PanelId};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Alarm panel connection daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "alarm-connect-daemon")]
#[command(about = "Keeps connections to alarm panels and routes service calls to them", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Show timestamps in logs
    #[arg(long, default_value = "true")]
    pub timestamps: bool,

    /// Daemon configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Maintenance subcommand
    #[command(subcommand)]
    pub command: Option<DiagnosticCommand>,
}

/// Offline maintenance commands
#[derive(Subcommand, Debug)]
pub enum DiagnosticCommand {
    /// Migrate stored entries to the current schema version
    Migrate {
        /// Only report what would change
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate stored entries without connecting
    Check,

    /// Show current configuration
    DumpConfig,
}

/// Initialize logging based on CLI configuration
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}

/// Run a maintenance command
pub fn handle_diagnostic_command(command: &DiagnosticCommand, config: &Config) -> Result<()> {
    match command {
        DiagnosticCommand::Migrate { dry_run } => migrate_entries(config, *dry_run),
        DiagnosticCommand::Check => check_entries(config),
        DiagnosticCommand::DumpConfig => {
            let contents =
                toml::to_string_pretty(config).context("Failed to serialize config")?;
            println!("{}", contents);
            Ok(())
        }
    }
}

fn migrate_entries(config: &Config, dry_run: bool) -> Result<()> {
    let mut store = EntryStore::load(&config.paths.entries_file)?;
    let migrator = Migrator::default();
    let mut migrated = 0;

    for entry in store.entries_mut() {
        let from = entry.version;
        match migrator.migrate_entry(entry) {
            Ok(true) => {
                migrated += 1;
                println!(
                    "{}: version {} -> {}",
                    entry.entry_id, from, entry.version
                );
            }
            Ok(false) => {}
            Err(e) => println!("{}: {}", entry.entry_id, e),
        }
    }

    if migrated == 0 {
        println!("All entries are current");
    } else if dry_run {
        println!("{} entries would be migrated", migrated);
    } else {
        store.save()?;
        println!(
            "Migrated {} entries in {}",
            migrated,
            store.path().display()
        );
    }

    Ok(())
}

/// Problems found in one entry, empty when it is fine
fn entry_problems(
    entry: &ConfigEntry,
    migrator: &Migrator,
    panels: &mut HashMap<PanelId, String>,
) -> Vec<String> {
    let mut entry = entry.clone();
    if let Err(e) = migrator.migrate_entry(&mut entry) {
        return vec![e.to_string()];
    }

    let merged = entry.combined();
    let mut problems = Vec::new();

    match panel_id_from(&merged) {
        Ok(panel_id) => {
            if let Some(owner) = panels.get(&panel_id) {
                problems.push(format!("panel {} is also used by {}", panel_id, owner));
            } else {
                panels.insert(panel_id, entry.entry_id.to_string());
            }
        }
        Err(e) => problems.push(e.to_string()),
    }

    if let Err(e) = LinkTarget::from_config(&merged) {
        problems.push(e.to_string());
    }

    problems
}

fn check_entries(config: &Config) -> Result<()> {
    let store = EntryStore::load(&config.paths.entries_file)?;
    let migrator = Migrator::default();
    let mut panels = HashMap::new();
    let mut failed = 0;

    println!(
        "Checking {} entries in {}",
        store.entries().len(),
        store.path().display()
    );

    for entry in store.entries() {
        let problems = entry_problems(entry, &migrator, &mut panels);
        if problems.is_empty() {
            println!("  {}: ok", entry.entry_id);
        } else {
            failed += 1;
            for problem in problems {
                println!("  {}: {}", entry.entry_id, problem);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} entries have problems", failed);
    }

    Ok(())
}

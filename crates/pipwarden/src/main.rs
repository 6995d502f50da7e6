//! pipwarden - sandboxed file-access monitoring for build tools
//!
//! Main entry point for the pipwarden CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{config, exec, journal, manifest};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// pipwarden - sandboxed file-access monitoring for build tools
#[derive(Parser)]
#[command(name = "pipwarden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a serialized tool invocation and write its result (external helper)
    Exec(exec::ExecArgs),

    /// Replay a shared opaque output journal
    Journal(journal::JournalArgs),

    /// Build or inspect a file access manifest
    Manifest(manifest::ManifestArgs),

    /// Show resolved configuration
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = pipwarden_config::load_config(None);
    let logging = loaded.config.logging.clone().unwrap_or_default();

    // Console (human-readable, stderr) + rotating JSON file
    let level = if cli.verbose {
        "debug"
    } else {
        logging.level.as_str()
    };
    let filter = format!(
        "pipwarden={level},pipwarden_sandbox={level},pipwarden_exec={level},pipwarden_config={level},warn"
    );

    let file_layer = if logging.file {
        let log_dir = logging
            .dir
            .clone()
            .or_else(|| pipwarden_config::user_config_dir().map(|d| d.join("logs")))
            .unwrap_or_else(|| std::path::PathBuf::from("logs"));
        let file_appender = tracing_appender::rolling::daily(&log_dir, "pipwarden.log");
        Some(tracing_appender::non_blocking(file_appender))
    } else {
        None
    };
    let (file_writer, _guard) = match file_layer {
        Some((writer, guard)) => (Some(writer), Some(guard)),
        None => (None, None),
    };

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(file_writer.map(|writer| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "pipwarden=trace,pipwarden_sandbox=trace,pipwarden_exec=trace,pipwarden_config=trace,info",
                ))
        }))
        .init();

    for warning in &loaded.warnings {
        tracing::debug!(warning = %warning, "Config warning");
    }

    // Create context for commands
    let ctx = commands::Context {
        json_output: cli.json,
        verbose: cli.verbose,
        config: loaded,
    };

    // Dispatch to command handlers
    match cli.command {
        Commands::Exec(args) => exec::run(args, &ctx).await,
        Commands::Journal(args) => journal::run(args, &ctx).await,
        Commands::Manifest(args) => manifest::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}

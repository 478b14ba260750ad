//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod cleanup;
mod discover;
mod import;
mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{load_settings_with_options, LoadOptions};

#[derive(Parser)]
#[command(name = "parlsync")]
#[command(about = "Legislature open-data discovery, change detection and import")]
#[command(version)]
pub struct Cli {
    /// Data directory or database file (overrides config file).
    /// Can be a directory containing parlsync.db or a .db file directly.
    #[arg(long, short = 'd', global = true)]
    data: Option<PathBuf>,

    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the configured seeds and report new, changed and gone resources
    Discover {
        /// Persist discovery results (without this flag nothing is written)
        #[arg(long)]
        save: bool,
    },

    /// Discover, detect changes and import changed resources
    Import {
        /// Treat every discovered resource as changed
        #[arg(short, long, conflicts_with = "queued_only")]
        force: bool,
        /// Skip discovery and only drain the import queue
        #[arg(long)]
        queued_only: bool,
    },

    /// Show resource, queue and failure counts
    Status {
        /// Number of failures to list
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Reclaim stale leases and close abandoned runs
    Cleanup {
        /// Also delete orphaned payload files and compact the database
        #[arg(long)]
        full: bool,
    },
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        data: cli.data,
    };
    let (settings, _config) = load_settings_with_options(options)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    match cli.command {
        Commands::Discover { save } => discover::cmd_discover(&settings, save).await,
        Commands::Import { force, queued_only } => {
            import::cmd_import(&settings, force, queued_only).await
        }
        Commands::Status { limit } => status::cmd_status(&settings, limit).await,
        Commands::Cleanup { full } => cleanup::cmd_cleanup(&settings, full).await,
    }
}

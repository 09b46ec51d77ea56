//! # strata CLI Module
//!
//! ## Available Commands
//!
//! - `worker` - Serve fan-out invocations over HTTP
//! - `monitor` - Run one monitor tick for a stem and drain the pipeline
//! - `status` - Show graph size
//! - `record` - Show the staged record of one id
//! - `stem` - Parse an identifier stem
//! - `init` - Write a configuration template and create the database

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use strata::config::StrataConfig;
use strata_core::StrataError;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// strata - staged graph ingestion
///
/// Claims new source ids, regulates their rows into vertices, resolves
/// related objects and loads the result into a property graph.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Database directory (overrides the configuration)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve fan-out invocations over HTTP
    Worker {
        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run one monitor tick and process every order it produces
    Monitor {
        /// Identifier stem to monitor, e.g. '#vertex#Patient#{"id_source":"Algernon"}#'
        #[arg(short, long)]
        stem: String,

        /// Source fixture (overrides the configuration)
        #[arg(long)]
        source: Option<PathBuf>,
    },

    /// Show graph size
    Status,

    /// Show the staged record of one id
    Record {
        /// Identifier stem of the record
        #[arg(short, long)]
        stem: String,

        /// Id value of the record
        #[arg(short, long)]
        id: String,
    },

    /// Parse an identifier stem and show its extraction keywords
    Stem {
        /// Raw stem string
        raw: String,
    },

    /// Write a configuration template and create the database directory
    Init {
        /// Overwrite an existing configuration file
        #[arg(short, long)]
        force: bool,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Default configuration file written by `init`.
const DEFAULT_CONFIG_PATH: &str = "strata.toml";

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), StrataError> {
    let json_mode = cli.json_mode;

    if let Some(Commands::Init { force }) = cli.command {
        let path = cli
            .config
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        return cmd_init(&path, cli.database.as_deref(), force);
    }

    let mut config = StrataConfig::load(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.storage.database = database;
    }

    match cli.command {
        Some(Commands::Worker { host, port }) => {
            if let Some(host) = host {
                config.worker.host = host;
            }
            if let Some(port) = port {
                config.worker.port = port;
            }
            cmd_worker(&config).await
        }
        Some(Commands::Monitor { stem, source }) => {
            if let Some(source) = source {
                config.monitor.source = source;
            }
            cmd_monitor(&config, &stem, json_mode).await
        }
        Some(Commands::Record { stem, id }) => cmd_record(&config, &stem, &id, json_mode),
        Some(Commands::Stem { raw }) => cmd_stem(&raw, json_mode),
        Some(Commands::Status) | None => cmd_status(&config, json_mode),
        Some(Commands::Init { .. }) => Ok(()),
    }
}

//! # strata
//!
//! The binary for the strata ingestion pipeline.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      apps/strata (THE BINARY)                   │
//! │                                                                 │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────┐     │
//! │  │   CLI       │    │  Worker API │    │  Pipeline actors │     │
//! │  │  (clap)     │    │   (axum)    │    │  + fan-out       │     │
//! │  └──────┬──────┘    └──────┬──────┘    └────────┬─────────┘     │
//! │         │                  │                    │               │
//! │         └──────────────────┼────────────────────┘               │
//! │                            ▼                                    │
//! │                    ┌───────────────┐                            │
//! │                    │  strata-core  │                            │
//! │                    │ (THE ENGINE)  │                            │
//! │                    └───────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! strata init
//! strata monitor --stem '#vertex#Patient#{"id_source":"Algernon"}#'
//! strata record --stem '#vertex#Patient#{"id_source":"Algernon"}#' --id 1002
//! strata worker --host 0.0.0.0 --port 8080
//! ```

mod cli;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // STRATA_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("STRATA_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "strata=info,strata_core=info,tower_http=debug".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the startup banner.
fn print_banner() {
    println!(
        r#"
  ███████╗████████╗██████╗  █████╗ ████████╗ █████╗
  ██╔════╝╚══██╔══╝██╔══██╗██╔══██╗╚══██╔══╝██╔══██╗
  ███████╗   ██║   ██████╔╝███████║   ██║   ███████║
  ╚════██║   ██║   ██╔══██╗██╔══██║   ██║   ██╔══██║
  ███████║   ██║   ██║  ██║██║  ██║   ██║   ██║  ██║
  ╚══════╝   ╚═╝   ╚═╝  ╚═╝╚═╝  ╚═╝   ╚═╝   ╚═╝  ╚═╝

  Staged graph ingestion v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}

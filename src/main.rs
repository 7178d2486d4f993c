//! # Search Relay CLI (`relay`)
//!
//! ## Usage
//!
//! ```bash
//! relay --config ./config/relay.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `relay serve` | Start the ingress service (`GET /search`, `GET /health`) |
//! | `relay ask "<prompt>"` | Run one search-augmented generation and stream the answer |
//!
//! Both accept `--memory` to use an in-process topic instead of AMQP.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use search_relay::{augment, config, logging, server};

/// Search Relay: search-augmented generation over a message bus.
#[derive(Parser)]
#[command(
    name = "relay",
    about = "Search Relay: search-augmented generation over a message bus",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the ingress service.
    ///
    /// Binds to `[server].bind`, publishes search results to
    /// `[broker].topic`, and shuts down cleanly on Ctrl-C.
    Serve {
        /// Use an in-process topic instead of connecting to the broker.
        #[arg(long)]
        memory: bool,
    },

    /// Answer a prompt with freshly searched context.
    ///
    /// Triggers a search (in-process, or via `[generation].trigger_url`),
    /// waits up to `[correlation].deadline_secs` for the result, and streams
    /// the generated answer to stdout.
    Ask {
        /// The prompt to answer.
        prompt: String,

        /// Use an in-process topic instead of connecting to the broker.
        #[arg(long)]
        memory: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_subscriber(&cfg.logging);

    match cli.command {
        Commands::Serve { memory } => {
            server::run_server(&cfg, memory).await?;
        }
        Commands::Ask { prompt, memory } => {
            augment::run_ask(&cfg, &prompt, memory).await?;
        }
    }

    Ok(())
}

//! Lumen CLI - asynchronous image transform pipeline.
//!
//! Runs the upload service and a broker-fed worker pool in one process over
//! in-memory backends, which makes it handy for trying operation chains.
//!
//! # Usage
//!
//! ```bash
//! # Thumbnail and watermark a directory of photos, writing artifacts to ./out
//! lumen run ./photos --op thumbnail:size=200 --op watermark:text=draft --output ./out
//!
//! # View configuration
//! lumen config show
//! ```

use clap::{Parser, Subcommand};

mod cli;
mod logging;

/// Lumen - asynchronous image transform pipeline.
#[derive(Parser, Debug)]
#[command(name = "lumen")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload images, process them with a worker pool, and report their status
    Run(cli::run::RunArgs),

    /// View and manage configuration
    Config(cli::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging isn't initialized yet, so config warnings go through eprintln
    let config = match lumen_core::Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Warning: Failed to load config: {e}\n  \
                 Using default configuration. Check your config file with `lumen config path`."
            );
            lumen_core::Config::default()
        }
    };
    logging::init_from_config(&config, cli.verbose, cli.json_logs);

    tracing::debug!("Lumen v{}", lumen_core::VERSION);

    match cli.command {
        Commands::Run(args) => cli::run::execute(args, config).await,
        Commands::Config(args) => cli::config::execute(args).await,
    }
}

//! The `lumen config` command.

use clap::{Args, Subcommand};
use lumen_core::Config;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Display the effective configuration
    Show,

    /// Show the config file path
    Path,

    /// Write a config file with defaults
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

pub async fn execute(args: ConfigArgs) -> anyhow::Result<()> {
    match args.command {
        ConfigCommand::Show => {
            let config = Config::load()?;
            println!("{}", config.to_toml()?);
        }

        ConfigCommand::Path => {
            println!("{}", Config::default_path().display());
        }

        ConfigCommand::Init { force } => {
            let path = Config::default_path();
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at: {}\nUse --force to overwrite.",
                    path.display()
                );
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, Config::default().to_toml()?)?;

            tracing::info!(path = %path.display(), "Config file created");
            println!("Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

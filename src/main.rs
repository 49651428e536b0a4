//! marge - merge bot for GitLab

mod cli;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use marge_bot::config::BotConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// marge - merges GitLab merge requests assigned to her
#[derive(Parser, Debug)]
#[command(name = "marge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the config file (default: <config dir>/marge/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Merge assigned requests until interrupted
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Validate the config, token and project access
    CheckConfig,
}

fn init_tracing(log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_ref())?;

    let config = BotConfig::load(cli.config.as_deref()).context("failed to load config")?;

    match cli.command {
        Commands::Run { once } => cli::run_bot(&config, cli::RunOptions { once })
            .await
            .context("bot stopped")?,
        Commands::CheckConfig => cli::check_config(&config)
            .await
            .context("config check failed")?,
    }
    Ok(())
}

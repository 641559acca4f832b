//! dbshuttle backup agent entry point.

mod app;
mod config;
mod system;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dbshuttle-agent", version, about = "Backs up a MySQL instance to a dbshuttle receiver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (created with defaults if missing)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the receiver address
    #[arg(short, long, global = true)]
    server: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stop MySQL, archive its data directory, transfer it and restart MySQL
    Backup {
        /// Keep the archive after the receiver confirms it
        #[arg(long)]
        keep_archive: bool,
    },
    /// Continue an interrupted backup
    Resume {
        /// Archive left by the interrupted run
        #[arg(long)]
        archive: Option<PathBuf>,
        /// Resume token of the interrupted transfer
        #[arg(long)]
        token: Option<String>,
    },
    /// Transfer a single file without touching MySQL
    Send {
        file: PathBuf,
        /// Resume token of an earlier attempt
        #[arg(long)]
        token: Option<String>,
    },
    /// Show what the receiver holds for a transfer
    Status { transfer_id: String, token: String },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(config::default_config_path);
    let mut config = config::Config::load(&path)?;
    if let Some(server) = cli.server {
        config.server_addr = server;
    }
    tracing::debug!(path = %path.display(), server = %config.server_addr, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Commands::Backup { keep_archive } => app::backup(config, keep_archive).await,
            Commands::Resume { archive, token } => app::resume(config, archive, token).await,
            Commands::Send { file, token } => app::send(config, &file, token).await,
            Commands::Status { transfer_id, token } => {
                app::status(config, &transfer_id, &token).await
            }
        }
    })
}

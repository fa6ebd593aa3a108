mod commands;
pub mod error;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::SyncConfig;
use crate::storage::StorageManager;
use error::CliResult;

#[derive(Parser)]
#[command(name = "peersync")]
#[command(author, version, about = "Peer-to-peer database sync", long_about = None)]
pub struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/peersync/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the device name shown to peers
    #[arg(long, global = true)]
    pub name: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send this device's database to a receiver
    Send {
        /// Address to listen on (default: 0.0.0.0:7878)
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Replace this device's database with a sender's
    Receive {
        /// Sender address to probe, repeatable
        #[arg(long = "peer")]
        peers: Vec<SocketAddr>,
        /// Device id or name to connect to (default: first found)
        #[arg(long)]
        device: Option<String>,
        /// How long to look for a sender
        #[arg(long, default_value = "10")]
        scan_secs: u64,
    },
    /// Show database location and row counts
    Status,
    /// Drop and recreate all tables
    Reset,
    /// Write a snapshot of the database to a JSON file
    Export {
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Replace tables with the contents of a snapshot file
    Import {
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Delete the database files
    Delete,
}

/// Initialize tracing subscriber with env filter
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peersync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

impl Cli {
    /// Config file values with the global flags applied.
    fn resolve_config(&self) -> CliResult<SyncConfig> {
        let mut config = SyncConfig::load(self.config.as_deref())?;
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(name) = &self.name {
            config.device_name = name.clone();
        }
        Ok(config)
    }
}

pub async fn run() -> CliResult<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = cli.resolve_config()?;

    let output = match cli.command {
        Some(Commands::Send { listen }) => {
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            commands::transfer::send(&config).await?
        }
        Some(Commands::Receive {
            peers,
            device,
            scan_secs,
        }) => {
            if !peers.is_empty() {
                config.peers = peers;
            }
            commands::transfer::receive(&config, device.as_deref(), scan_secs).await?
        }
        Some(Commands::Status) => commands::database::status(&storage(&config)).await?,
        Some(Commands::Reset) => commands::database::reset(&storage(&config)).await?,
        Some(Commands::Export { output }) => {
            commands::database::export(&storage(&config), &output).await?
        }
        Some(Commands::Import { input }) => {
            commands::database::import(&storage(&config), &input).await?
        }
        Some(Commands::Delete) => commands::database::delete(&storage(&config)).await?,
        None => {
            // Show help when no command provided
            let _ = Cli::parse_from(["peersync", "--help"]);
            return Ok(());
        }
    };

    println!("{}", output);
    Ok(())
}

fn storage(config: &SyncConfig) -> StorageManager {
    StorageManager::new(config.storage_config())
}

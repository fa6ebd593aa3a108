use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::StorageError;
use crate::sync::SyncError;

#[derive(Error, Diagnostic, Debug)]
pub enum CliError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Sync(#[from] SyncError),

    #[error("Failed to access {path}: {source}")]
    #[diagnostic(code(peersync::cli::file))]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No sender found within {seconds} seconds")]
    #[diagnostic(
        code(peersync::cli::no_sender),
        help(
            "Is the sender running? Pass its address with --peer, e.g. --peer 192.168.1.20:7878"
        )
    )]
    NoSender { seconds: u64 },

    #[error("Device {device_id} was not discovered")]
    #[diagnostic(code(peersync::cli::unknown_device))]
    UnknownDevice { device_id: String },
}

pub type CliResult<T> = Result<T, CliError>;

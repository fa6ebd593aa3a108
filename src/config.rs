//! Runtime configuration.
//!
//! Values come from a YAML file (explicit `--config` path, or
//! `config.yaml` in the peersync config directory when present), then CLI
//! flags override individual fields.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::storage::{DEFAULT_DB_FILE, StorageConfig, get_config_dir, get_data_dir};
use crate::transport::TransportKind;

pub const DEFAULT_SERVICE_ID: &str = "peersync-v1";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7878";
const CONFIG_FILE: &str = "config.yaml";

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    #[diagnostic(code(peersync::config::read))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    #[diagnostic(
        code(peersync::config::parse),
        help("Check the YAML syntax and field names of the config file.")
    )]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Name shown to peers while advertising.
    pub device_name: String,
    /// Stable session identifier both sides must share.
    pub service_id: String,
    pub data_dir: PathBuf,
    pub db_file: String,
    pub transport: TransportKind,
    pub listen_addr: SocketAddr,
    /// Static address book scanned by the TCP transport.
    pub peers: Vec<SocketAddr>,
    /// Open the database without write access.
    pub read_only: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            service_id: DEFAULT_SERVICE_ID.to_string(),
            data_dir: get_data_dir(),
            db_file: DEFAULT_DB_FILE.to_string(),
            transport: TransportKind::default(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7878)),
            peers: Vec::new(),
            read_only: false,
        }
    }
}

fn default_device_name() -> String {
    env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "peersync-device".to_string())
}

impl SyncConfig {
    /// Load from `path`, or from the default config file when it exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = get_config_dir().join(CONFIG_FILE);
                if default_path.is_file() {
                    Self::from_file(&default_path)
                } else {
                    debug!(path = %default_path.display(), "No config file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document deserializes to unit, not to a defaulted struct
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Identifier of this device on the link: the device name with
    /// whitespace collapsed to dashes.
    pub fn device_id(&self) -> String {
        self.device_name
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-")
            .to_lowercase()
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_file)
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::new(&self.data_dir, &self.db_file).with_read_only(self.read_only)
    }
}

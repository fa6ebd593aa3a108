//! Path resolution for peersync directories.
//!
//! Follows the XDG base directory layout.

use std::env;
use std::path::PathBuf;

const APP_DIR: &str = "peersync";

/// Default database file name inside the data directory.
pub const DEFAULT_DB_FILE: &str = "peersync.db";

fn home_relative(xdg_var: &str, fallback: &str) -> PathBuf {
    env::var_os(xdg_var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(fallback)))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get XDG-compliant data directory for peersync.
///
/// # Returns
/// `$XDG_DATA_HOME/peersync`, or `~/.local/share/peersync`
pub fn get_data_dir() -> PathBuf {
    home_relative("XDG_DATA_HOME", ".local/share").join(APP_DIR)
}

/// Get XDG-compliant config directory for peersync.
///
/// # Returns
/// `$XDG_CONFIG_HOME/peersync`, or `~/.config/peersync`
pub fn get_config_dir() -> PathBuf {
    home_relative("XDG_CONFIG_HOME", ".config").join(APP_DIR)
}

/// Get database file path (data_dir/peersync.db).
pub fn get_db_path() -> PathBuf {
    get_data_dir().join(DEFAULT_DB_FILE)
}

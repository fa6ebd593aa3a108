//! Local storage lifecycle.
//!
//! The storage manager owns the single SQLite connection and exposes
//! idempotent initialize, verify, reset, export, import and delete
//! operations on top of it.
//!
//! # Architecture
//!
//! - `manager`: connection lifecycle, single-flight init, reset fallback
//! - `schema`: the fixed table set and first-start seed
//! - `snapshot`: full-database export format
//! - `catalog`: raw SQLite catalog and table access
//! - `error`: storage error taxonomy

mod catalog;
mod error;
mod manager;
mod paths;
mod schema;
mod snapshot;


pub use error::{CLOSED_MESSAGE, READ_ONLY_MESSAGE, StorageError, StorageResult};
pub use manager::{ConnectionState, StorageConfig, StorageConnection, StorageManager};
pub use paths::{DEFAULT_DB_FILE, get_config_dir, get_data_dir, get_db_path};
pub use schema::{Schema, SeedSpec, TableSpec};
pub use snapshot::{DatabaseSnapshot, SnapshotRow};

//! Storage error types.
//!
//! Errors carry their cause as text so a single failed initialization can be
//! cloned out to every caller that was waiting on it. Raw `sqlx` and I/O
//! failures are classified on the way in: read-only media and use of a
//! closed handle get dedicated variants with user-facing messages, everything
//! else keeps its original cause text.

use miette::Diagnostic;
use thiserror::Error;

/// Message shown when the storage medium rejects writes.
pub const READ_ONLY_MESSAGE: &str =
    "Storage is read-only: the database file or its directory is not writable";

/// Message shown when a torn-down connection is used.
pub const CLOSED_MESSAGE: &str =
    "Storage connection is closed: the database was used after it was torn down";

/// Storage lifecycle errors.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage initialization failed after retry: {message}")]
    #[diagnostic(
        code(peersync::storage::init_failed),
        help("The database was recreated once and still failed. Check the data directory.")
    )]
    Init { message: String },

    #[error("Storage is read-only: the database file or its directory is not writable")]
    #[diagnostic(
        code(peersync::storage::read_only),
        help("Make sure the data directory is writable by the current user.")
    )]
    ReadOnly { cause: String },

    #[error("Storage connection is closed: the database was used after it was torn down")]
    #[diagnostic(code(peersync::storage::closed))]
    Closed { cause: String },

    #[error("Schema verification failed: missing required table(s): {}", .missing.join(", "))]
    #[diagnostic(code(peersync::storage::schema_verification))]
    SchemaVerification { missing: Vec<String> },

    #[error("Database error: {message}")]
    #[diagnostic(code(peersync::storage::database))]
    Database { message: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(peersync::storage::io))]
    Io { message: String },

    #[error("Invalid snapshot: {message}")]
    #[diagnostic(code(peersync::storage::snapshot))]
    Snapshot { message: String },
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Classify a raw failure message from the storage engine.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();

        if lowered.contains("readonly") || lowered.contains("read-only") {
            StorageError::ReadOnly { cause: message }
        } else if lowered.contains("pool closed")
            || lowered.contains("pool has been closed")
            || lowered.contains("database is closed")
        {
            StorageError::Closed { cause: message }
        } else {
            StorageError::Database { message }
        }
    }

    /// Convert a failure of the final creation attempt into the error that is
    /// surfaced to callers. State errors keep their dedicated message.
    pub fn into_fatal(self) -> Self {
        match self {
            StorageError::ReadOnly { .. } | StorageError::Closed { .. } | StorageError::Init { .. } => {
                self
            }
            other => StorageError::Init {
                message: other.to_string(),
            },
        }
    }

    /// Whether this error is one of the storage state causes.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            StorageError::ReadOnly { .. } | StorageError::Closed { .. }
        )
    }

    /// The underlying cause text, before any user-facing rewording.
    pub fn cause(&self) -> String {
        match self {
            StorageError::ReadOnly { cause } | StorageError::Closed { cause } => cause.clone(),
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolClosed => StorageError::Closed {
                cause: e.to_string(),
            },
            other => StorageError::classify(other.to_string()),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::ReadOnlyFilesystem => {
                StorageError::ReadOnly {
                    cause: e.to_string(),
                }
            }
            _ => StorageError::Io {
                message: e.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Snapshot {
            message: e.to_string(),
        }
    }
}

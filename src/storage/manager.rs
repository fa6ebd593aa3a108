//! Storage lifecycle manager.
//!
//! Owns the one process-wide SQLite connection. Callers never hold the pool
//! directly; they ask the manager, which lazily creates the database,
//! applies and verifies the schema, and tears it down on delete or reset.
//!
//! Concurrent `initialize` calls are coalesced into a single attempt. A
//! failed attempt is retried once from scratch (the partial file is
//! removed first); a second failure is fatal.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::{debug, info, instrument, warn};

use super::catalog;
use super::error::{StorageError, StorageResult};
use super::schema::Schema;
use super::snapshot::DatabaseSnapshot;

type InitFuture = Shared<BoxFuture<'static, StorageResult<StorageConnection>>>;

/// Where the database lives and what it must contain.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub file_name: String,
    pub schema: Schema,
    /// Open without write access. Nothing is created, migrated or removed.
    pub read_only: bool,
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            file_name: file_name.into(),
            schema: Schema::application(),
            read_only: false,
        }
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.file_name)
    }
}

/// Lifecycle of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Initializing,
    Ready,
    Resetting,
    /// First attempt failed, the retry is pending.
    Failed,
    /// Retry failed too.
    Fatal,
    Deleted,
}

/// Handle to the open database.
///
/// Cloning shares the same underlying pool. `generation` identifies the
/// creation that produced it, so two handles with equal generations are the
/// same connection.
#[derive(Debug, Clone)]
pub struct StorageConnection {
    pool: SqlitePool,
    generation: u64,
}

impl StorageConnection {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub fn same_as(&self, other: &StorageConnection) -> bool {
        self.generation == other.generation
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Liveness probe: a trivial read.
    async fn probe(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

struct ManagerState {
    phase: ConnectionState,
    connection: Option<StorageConnection>,
    in_flight: Option<InitFuture>,
}

struct Inner {
    config: StorageConfig,
    state: Mutex<ManagerState>,
    // Serializes reset, delete, export and import.
    ops: tokio::sync::Mutex<()>,
    attempts: AtomicUsize,
    generation: AtomicU64,
}

/// The storage lifecycle manager. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct StorageManager {
    inner: Arc<Inner>,
}

impl StorageManager {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ManagerState {
                    phase: ConnectionState::Uninitialized,
                    connection: None,
                    in_flight: None,
                }),
                ops: tokio::sync::Mutex::new(()),
                attempts: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    pub fn db_path(&self) -> PathBuf {
        self.inner.config.db_path()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_state().phase
    }

    /// Number of underlying creation attempts made so far.
    pub fn creation_attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Get a connection to a schema-verified store.
    ///
    /// Reuses the cached connection if it passes a liveness probe. Callers
    /// arriving while an attempt is running wait for that attempt and get
    /// its result.
    pub async fn initialize(&self) -> StorageResult<StorageConnection> {
        if let Some(conn) = self.inner.cached() {
            match conn.probe().await {
                Ok(()) => return Ok(conn),
                Err(e) => {
                    warn!(error = %e, generation = conn.generation, "Cached connection failed probe, recreating");
                    self.inner.discard(&conn);
                    conn.pool.close().await;
                }
            }
        }

        let attempt = {
            let mut state = self.inner.lock_state();
            if let Some(conn) = &state.connection {
                return Ok(conn.clone());
            }
            match &state.in_flight {
                Some(attempt) => {
                    debug!("Joining in-flight storage initialization");
                    attempt.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let attempt = async move {
                        let result = inner.create_with_retry().await;
                        inner.settle(&result);
                        result
                    }
                    .boxed()
                    .shared();
                    state.phase = ConnectionState::Initializing;
                    state.in_flight = Some(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    /// Verify that every required table exists.
    pub async fn verify_schema(&self) -> StorageResult<()> {
        let conn = self.initialize().await?;
        self.inner.verify(&conn).await
    }

    /// True only if both the data directory and the database file exist.
    pub fn exists(&self) -> bool {
        let config = &self.inner.config;
        if !config.data_dir.is_dir() {
            return false;
        }
        config.db_path().is_file()
    }

    /// Release the connection and remove the database and its side files.
    #[instrument(skip(self), fields(path = %self.db_path().display()))]
    pub async fn delete(&self) -> StorageResult<()> {
        let _guard = self.inner.ops.lock().await;
        if !self.exists() {
            debug!("Nothing to delete");
            return Ok(());
        }
        self.inner.teardown().await?;
        info!("Database deleted");
        Ok(())
    }

    /// Drop and recreate every table on the live connection.
    ///
    /// Without a live connection this is the same as `initialize`. If the
    /// in-place reset fails the database is destroyed and recreated, and the
    /// recovered connection is returned.
    #[instrument(skip(self))]
    pub async fn reset(&self) -> StorageResult<StorageConnection> {
        let _guard = self.inner.ops.lock().await;

        let Some(conn) = self.inner.cached() else {
            debug!("No live connection, resetting by initialization");
            return self.initialize().await;
        };

        self.inner.set_phase(ConnectionState::Resetting);
        match self.inner.reset_in_place(&conn).await {
            Ok(dropped) => {
                self.inner.set_phase(ConnectionState::Ready);
                info!(tables = dropped.len(), "Database reset in place");
                Ok(conn)
            }
            Err(e) => {
                warn!(error = %e, "In-place reset failed, recreating database");
                self.inner.teardown().await.map_err(StorageError::into_fatal)?;
                let recovered = self.initialize().await?;
                info!(generation = recovered.generation, "Database recreated after failed reset");
                Ok(recovered)
            }
        }
    }

    /// Read every row of every known table in one transaction.
    pub async fn export_snapshot(&self) -> StorageResult<DatabaseSnapshot> {
        let _guard = self.inner.ops.lock().await;
        let conn = self.initialize().await?;

        let mut tx = conn.pool.begin().await?;
        let mut snapshot = DatabaseSnapshot::new();
        for table in self.inner.config.schema.table_names() {
            let rows = catalog::read_rows(&mut tx, table).await?;
            snapshot.tables.insert(table.to_string(), rows);
        }
        tx.commit().await?;

        debug!(rows = snapshot.total_rows(), "Exported snapshot");
        Ok(snapshot)
    }

    /// Replace the contents of every known table the snapshot carries.
    ///
    /// Tables outside the schema are ignored; schema tables missing from the
    /// snapshot are left untouched. Runs in one transaction.
    pub async fn import_snapshot(&self, snapshot: &DatabaseSnapshot) -> StorageResult<()> {
        let _guard = self.inner.ops.lock().await;
        let conn = self.initialize().await?;
        let schema = &self.inner.config.schema;

        let mut tx = conn.pool.begin().await?;
        let mut imported = 0;
        for (table, rows) in &snapshot.tables {
            if !schema.contains(table) {
                debug!(table, "Ignoring table outside the schema");
                continue;
            }
            catalog::clear_table(&mut tx, table).await?;
            imported += catalog::insert_rows(&mut tx, table, rows).await?;
        }
        tx.commit().await?;

        info!(rows = imported, "Imported snapshot");
        Ok(())
    }

    /// Exact row counts of every known table.
    pub async fn row_counts(&self) -> StorageResult<BTreeMap<String, i64>> {
        let conn = self.initialize().await?;
        let mut db = conn.pool.acquire().await?;
        let mut counts = BTreeMap::new();
        for table in self.inner.config.schema.table_names() {
            counts.insert(table.to_string(), catalog::row_count(&mut db, table).await?);
        }
        Ok(counts)
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: ConnectionState) {
        self.lock_state().phase = phase;
    }

    fn cached(&self) -> Option<StorageConnection> {
        self.lock_state().connection.clone()
    }

    fn discard(&self, conn: &StorageConnection) {
        let mut state = self.lock_state();
        if state.connection.as_ref().is_some_and(|c| c.same_as(conn)) {
            state.connection = None;
            state.phase = ConnectionState::Initializing;
        }
    }

    fn settle(&self, result: &StorageResult<StorageConnection>) {
        let mut state = self.lock_state();
        state.in_flight = None;
        match result {
            Ok(conn) => {
                state.connection = Some(conn.clone());
                state.phase = ConnectionState::Ready;
            }
            Err(_) => state.phase = ConnectionState::Fatal,
        }
    }

    async fn create_with_retry(&self) -> StorageResult<StorageConnection> {
        match self.create_once().await {
            Ok(conn) => Ok(conn),
            Err(first) => {
                warn!(error = %first, "Storage initialization failed, retrying from scratch");
                self.set_phase(ConnectionState::Failed);
                if !self.config.read_only {
                    self.remove_files().await.map_err(StorageError::into_fatal)?;
                }
                self.create_once().await.map_err(|e| {
                    warn!(error = %e, "Storage initialization failed again");
                    e.into_fatal()
                })
            }
        }
    }

    async fn create_once(&self) -> StorageResult<StorageConnection> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.config.db_path();
        info!(attempt, path = %path.display(), "Opening database");

        tokio::fs::create_dir_all(&self.config.data_dir).await?;

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .busy_timeout(Duration::from_secs(5));
        let options = if self.config.read_only {
            options.read_only(true)
        } else {
            options
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let conn = StorageConnection {
            pool,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        };

        if let Err(e) = self.prepare(&conn).await {
            conn.pool.close().await;
            return Err(e);
        }
        Ok(conn)
    }

    async fn prepare(&self, conn: &StorageConnection) -> StorageResult<()> {
        let mut db = conn.pool.acquire().await?;
        catalog::apply_schema(&mut db, &self.config.schema).await?;
        drop(db);

        self.verify(conn).await?;
        self.seed_if_empty(conn).await
    }

    async fn verify(&self, conn: &StorageConnection) -> StorageResult<()> {
        let mut db = conn.pool.acquire().await?;
        let missing = catalog::missing_tables(&mut db, &self.config.schema).await?;
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StorageError::SchemaVerification { missing })
        }
    }

    async fn seed_if_empty(&self, conn: &StorageConnection) -> StorageResult<()> {
        let Some(seed) = &self.config.schema.seed else {
            return Ok(());
        };

        let mut tx = conn.pool.begin().await?;
        if catalog::row_count(&mut tx, &seed.table).await? == 0 {
            let inserted = catalog::insert_rows(&mut tx, &seed.table, &seed.rows).await?;
            info!(table = %seed.table, rows = inserted, "Seeded empty table");
        }
        tx.commit().await?;
        Ok(())
    }

    async fn reset_in_place(&self, conn: &StorageConnection) -> StorageResult<Vec<String>> {
        let mut tx = conn.pool.begin().await?;
        let dropped = catalog::drop_all_tables(&mut tx).await?;
        catalog::apply_schema(&mut tx, &self.config.schema).await?;
        tx.commit().await?;

        self.verify(conn).await?;
        Ok(dropped)
    }

    /// Release the cached connection, then remove the files.
    async fn teardown(&self) -> StorageResult<()> {
        if self.config.read_only {
            return Err(StorageError::ReadOnly {
                cause: "storage was opened read-only".to_string(),
            });
        }
        let released = {
            let mut state = self.lock_state();
            state.phase = ConnectionState::Deleted;
            state.connection.take()
        };
        if let Some(conn) = released {
            debug!(generation = conn.generation, "Closing connection");
            conn.pool.close().await;
        }

        self.remove_files().await?;
        self.set_phase(ConnectionState::Uninitialized);
        Ok(())
    }

    /// Remove the database file and any `-wal`, `-shm` or `-journal` siblings.
    async fn remove_files(&self) -> StorageResult<()> {
        let dir = &self.config.data_dir;
        if !dir.is_dir() {
            return Ok(());
        }

        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if is_database_file(&self.config.file_name, Path::new(&name)) {
                debug!(file = %entry.path().display(), "Removing database file");
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}

fn is_database_file(file_name: &str, candidate: &Path) -> bool {
    let Some(candidate) = candidate.to_str() else {
        return false;
    };
    candidate == file_name
        || candidate
            .strip_prefix(file_name)
            .is_some_and(|suffix| suffix.starts_with('-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_database_file_matches_side_files() {
        assert!(is_database_file("app.db", Path::new("app.db")));
        assert!(is_database_file("app.db", Path::new("app.db-wal")));
        assert!(is_database_file("app.db", Path::new("app.db-shm")));
        assert!(is_database_file("app.db", Path::new("app.db-journal")));
        assert!(!is_database_file("app.db", Path::new("app.db.bak")));
        assert!(!is_database_file("app.db", Path::new("other.db")));
    }

    #[test]
    fn test_db_path_joins_dir_and_file() {
        let config = StorageConfig::new("/tmp/peersync", "app.db");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/peersync/app.db"));
    }
}

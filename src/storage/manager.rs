//! SQLite engine wrapper: open modes, pragmas, timed statements.
//!
//! [`SqlManager`] owns one SQLite connection and applies the engine
//! configuration on open: WAL journaling, relaxed-but-durable sync, a
//! 64 MB page cache, memory temp store, a large mmap window, and foreign
//! keys. Read-only and in-memory connections skip pragmas that require
//! write access.
//!
//! Every statement executed through the manager is timed; the counters
//! feed `GraphStorage::get_metrics()`.

use std::fs::{File, OpenOptions as FsOpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, Transaction};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, StorageError};

/// Busy timeout applied to every connection.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// How the database should be opened.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    /// Open read-only; write pragmas are skipped.
    pub readonly: bool,
    /// Open an in-memory database (ignores the path).
    pub in_memory: bool,
    /// How long SQLite waits on a locked database before erroring.
    pub busy_timeout: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            readonly: false,
            in_memory: false,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl OpenOptions {
    /// Options for a read-only connection.
    pub fn read_only() -> Self {
        Self {
            readonly: true,
            ..Default::default()
        }
    }

    /// Options for an in-memory database (tests, scratch work).
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            ..Default::default()
        }
    }
}

/// Statement timing counters for one manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatementMetrics {
    /// Statements executed through this manager.
    pub statements: u64,
    /// Total execution time across all statements, in microseconds.
    pub total_micros: u64,
}

impl StatementMetrics {
    /// Mean statement latency in milliseconds (0.0 when idle).
    pub fn avg_ms(&self) -> f64 {
        if self.statements == 0 {
            0.0
        } else {
            (self.total_micros as f64 / self.statements as f64) / 1000.0
        }
    }
}

#[derive(Debug, Default)]
struct MetricsInner {
    statements: AtomicU64,
    total_micros: AtomicU64,
}

/// One SQLite connection with engine pragmas applied.
///
/// The connection lives behind a mutex so the manager is `Send + Sync`;
/// callers get at it through the timed [`with_conn`](Self::with_conn) /
/// [`with_tx`](Self::with_tx) scopes. Real read parallelism comes from
/// pooling several managers (see [`super::pool`]), not from sharing one.
pub struct SqlManager {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    readonly: bool,
    metrics: Arc<MetricsInner>,
}

impl std::fmt::Debug for SqlManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlManager")
            .field("path", &self.path)
            .field("readonly", &self.readonly)
            .finish_non_exhaustive()
    }
}

impl SqlManager {
    /// Opens or creates a database at the given path.
    ///
    /// A writable on-disk open applies the full pragma set. If the file
    /// turns out to be corrupt, the manager moves it aside once
    /// (`<path>.corrupt-<millis>`) and retries with a fresh file before
    /// surfacing `StorageError::Unavailable`.
    ///
    /// # Errors
    ///
    /// - `StorageError::Unavailable` when the file cannot be opened
    /// - `StorageError::Integrity` when the file is corrupt on the retry
    #[instrument(skip(options), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();

        if options.in_memory {
            return Self::open_in_memory();
        }

        match Self::try_open(path, &options) {
            Ok(manager) => Ok(manager),
            Err(first_err) if !options.readonly && is_integrity(&first_err) => {
                // One rebuild attempt: move the corrupt file aside and start fresh.
                let aside = corrupt_aside_path(path);
                warn!(
                    error = %first_err,
                    aside = %aside.display(),
                    "Database corrupt; moving aside and rebuilding"
                );
                std::fs::rename(path, &aside).map_err(|e| {
                    StorageError::unavailable(format!(
                        "cannot move corrupt database aside: {e}"
                    ))
                })?;
                Self::try_open(path, &options)
            }
            Err(err) => Err(err),
        }
    }

    /// Wraps an externally opened connection.
    ///
    /// Used by tests that pool shared-cache in-memory connections; the
    /// caller is responsible for any pragmas it needs.
    pub(crate) fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            path: None,
            readonly: false,
            metrics: Arc::new(MetricsInner::default()),
        }
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StorageError::from)?;
        // In-memory connections still want FK enforcement for cascades.
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(StorageError::from)?;
        debug!("Opened in-memory database");
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            readonly: false,
            metrics: Arc::new(MetricsInner::default()),
        })
    }

    fn try_open(path: &Path, options: &OpenOptions) -> Result<Self> {
        let conn = if options.readonly {
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(StorageError::from)?
        } else {
            Connection::open(path).map_err(StorageError::from)?
        };

        conn.busy_timeout(options.busy_timeout)
            .map_err(StorageError::from)?;

        if options.readonly {
            // Read-only connections may not change journal mode or page
            // size; FK enforcement and query_only are safe.
            conn.pragma_update(None, "query_only", "ON")
                .map_err(StorageError::from)?;
            conn.pragma_update(None, "foreign_keys", "ON")
                .map_err(StorageError::from)?;
        } else {
            apply_write_pragmas(&conn)?;
            // Cheap corruption probe; full `integrity_check` is too slow
            // for every open.
            let probe: std::result::Result<String, _> =
                conn.query_row("PRAGMA quick_check(1)", [], |row| row.get(0));
            match probe {
                Ok(ref status) if status == "ok" => {}
                Ok(status) => {
                    return Err(StorageError::integrity(format!(
                        "quick_check reported: {status}"
                    ))
                    .into());
                }
                Err(e) => return Err(StorageError::from(e).into()),
            }
        }

        info!(readonly = options.readonly, "Database opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
            readonly: options.readonly,
            metrics: Arc::new(MetricsInner::default()),
        })
    }

    /// Runs a closure against the connection, timing it.
    ///
    /// This is the single choke point for reads: every query in the crate
    /// goes through here or [`with_tx`](Self::with_tx), which keeps the
    /// statement metrics complete.
    pub fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let start = Instant::now();
        let conn = self.conn.lock();
        let result = f(&conn);
        self.record(start.elapsed());
        result
    }

    /// Runs a closure inside a transaction, committing on success.
    ///
    /// The transaction rolls back when the closure errors or panics
    /// (rusqlite's drop behavior).
    pub fn with_tx<R>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<R>) -> Result<R> {
        let start = Instant::now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StorageError::from)?;
        let result = f(&tx);
        let result = match result {
            Ok(value) => {
                tx.commit().map_err(StorageError::from)?;
                Ok(value)
            }
            Err(err) => Err(err),
        };
        self.record(start.elapsed());
        result
    }

    /// Executes a single parameterless statement.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(sql).map_err(StorageError::from)?;
            Ok(())
        })
    }

    /// Reads `PRAGMA user_version`.
    pub fn user_version(&self) -> Result<u32> {
        self.with_conn(|conn| {
            let v: i64 = conn
                .query_row("PRAGMA user_version", [], |row| row.get(0))
                .map_err(StorageError::from)?;
            Ok(v as u32)
        })
    }

    /// Sets `PRAGMA user_version`.
    pub fn set_user_version(&self, version: u32) -> Result<()> {
        self.with_conn(|conn| {
            conn.pragma_update(None, "user_version", version as i64)
                .map_err(StorageError::from)?;
            Ok(())
        })
    }

    /// Health probe used by the pool: `SELECT 1` must round-trip.
    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            let one: i64 = conn
                .query_row("SELECT 1", [], |row| row.get(0))
                .map_err(StorageError::from)?;
            if one == 1 {
                Ok(())
            } else {
                Err(StorageError::integrity("SELECT 1 returned a non-1 value").into())
            }
        })
    }

    /// Returns the database file path, if this is an on-disk manager.
    pub fn db_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns true if this manager was opened read-only.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Returns a snapshot of the statement timing counters.
    pub fn statement_metrics(&self) -> StatementMetrics {
        StatementMetrics {
            statements: self.metrics.statements.load(Ordering::Relaxed),
            total_micros: self.metrics.total_micros.load(Ordering::Relaxed),
        }
    }

    /// Closes the connection, flushing WAL state.
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner();
        conn.close()
            .map_err(|(_, e)| StorageError::from(e))?;
        Ok(())
    }

    fn record(&self, elapsed: Duration) {
        self.metrics.statements.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }
}

/// Applies the writable-connection pragma set.
fn apply_write_pragmas(conn: &Connection) -> Result<()> {
    // page_size only takes effect before the first table is created;
    // harmless on existing files.
    conn.pragma_update(None, "page_size", 4096)
        .map_err(StorageError::from)?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(StorageError::from)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(StorageError::from)?;
    // Negative cache_size is KB: 64 MB page cache.
    conn.pragma_update(None, "cache_size", -64000)
        .map_err(StorageError::from)?;
    conn.pragma_update(None, "temp_store", "MEMORY")
        .map_err(StorageError::from)?;
    conn.pragma_update(None, "mmap_size", 30_000_000_000i64)
        .map_err(StorageError::from)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)
        .map_err(StorageError::from)?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(StorageError::from)?;
    Ok(())
}

fn is_integrity(err: &crate::error::CodeGraphError) -> bool {
    matches!(
        err,
        crate::error::CodeGraphError::Storage(StorageError::Integrity(_))
    )
}

fn corrupt_aside_path(path: &Path) -> PathBuf {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".corrupt-{millis}"));
    PathBuf::from(name)
}

/// Advisory lock asserting single-process ownership of a database file.
///
/// The lock file is `<db>.lock`; holding it exclusively for the process
/// lifetime prevents a second process from opening the same database for
/// writing. Dropped (and thereby released) when the owning handle closes.
#[derive(Debug)]
pub struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl ProcessLock {
    /// Acquires the lock for the database at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` when another process already
    /// holds the lock.
    pub fn acquire(db_path: &Path) -> Result<Self> {
        let mut lock_path = db_path.as_os_str().to_owned();
        lock_path.push(".lock");
        let path = PathBuf::from(lock_path);

        let file = FsOpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|_| {
            StorageError::unavailable(format!(
                "database {} is locked by another process",
                db_path.display()
            ))
        })?;

        debug!(lock = %path.display(), "Acquired process lock");
        Ok(Self { file, path })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        // Unlock errors on drop are unreportable; the OS releases the
        // lock when the fd closes anyway.
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let manager = SqlManager::open(&path, OpenOptions::default()).unwrap();
        assert!(path.exists());
        assert!(!manager.is_readonly());
        manager.close().unwrap();
    }

    #[test]
    fn test_wal_mode_applied() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let manager = SqlManager::open(&path, OpenOptions::default()).unwrap();
        let mode: String = manager
            .with_conn(|conn| {
                conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))
                    .map_err(StorageError::from)
                    .map_err(Into::into)
            })
            .unwrap();
        assert_eq!(mode, "wal");
        manager.close().unwrap();
    }

    #[test]
    fn test_in_memory_open() {
        let manager = SqlManager::open_in_memory().unwrap();
        assert!(manager.db_path().is_none());
        manager.ping().unwrap();
        manager.close().unwrap();
    }

    #[test]
    fn test_readonly_skips_write_pragmas() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        // Create the file first
        let writer = SqlManager::open(&path, OpenOptions::default()).unwrap();
        writer
            .execute_batch("CREATE TABLE t (x INTEGER)")
            .unwrap();
        writer.close().unwrap();

        let reader = SqlManager::open(&path, OpenOptions::read_only()).unwrap();
        assert!(reader.is_readonly());
        let result = reader.execute_batch("INSERT INTO t VALUES (1)");
        assert!(result.is_err(), "read-only connection must reject writes");
        reader.close().unwrap();
    }

    #[test]
    fn test_statement_metrics_accumulate() {
        let manager = SqlManager::open_in_memory().unwrap();
        manager.ping().unwrap();
        manager.ping().unwrap();
        let metrics = manager.statement_metrics();
        assert!(metrics.statements >= 2);
        manager.close().unwrap();
    }

    #[test]
    fn test_transaction_commits() {
        let manager = SqlManager::open_in_memory().unwrap();
        manager
            .execute_batch("CREATE TABLE t (x INTEGER)")
            .unwrap();
        manager
            .with_tx(|tx| {
                tx.execute("INSERT INTO t VALUES (1)", [])
                    .map_err(StorageError::from)?;
                tx.execute("INSERT INTO t VALUES (2)", [])
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .unwrap();
        let count: i64 = manager
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
                    .map_err(StorageError::from)
                    .map_err(Into::into)
            })
            .unwrap();
        assert_eq!(count, 2);
        manager.close().unwrap();
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let manager = SqlManager::open_in_memory().unwrap();
        manager
            .execute_batch("CREATE TABLE t (x INTEGER)")
            .unwrap();
        let result: Result<()> = manager.with_tx(|tx| {
            tx.execute("INSERT INTO t VALUES (1)", [])
                .map_err(StorageError::from)?;
            Err(StorageError::integrity("forced failure").into())
        });
        assert!(result.is_err());
        let count: i64 = manager
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
                    .map_err(StorageError::from)
                    .map_err(Into::into)
            })
            .unwrap();
        assert_eq!(count, 0);
        manager.close().unwrap();
    }

    #[test]
    fn test_user_version_round_trip() {
        let manager = SqlManager::open_in_memory().unwrap();
        assert_eq!(manager.user_version().unwrap(), 0);
        manager.set_user_version(2).unwrap();
        assert_eq!(manager.user_version().unwrap(), 2);
        manager.close().unwrap();
    }

    #[test]
    fn test_process_lock_excludes_second_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let lock = ProcessLock::acquire(&path).unwrap();
        assert!(ProcessLock::acquire(&path).is_err());
        drop(lock);
        assert!(ProcessLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_corrupt_file_moved_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        // Garbage that is not an SQLite header
        std::fs::write(&path, b"definitely not a database").unwrap();
        let manager = SqlManager::open(&path, OpenOptions::default()).unwrap();
        manager.ping().unwrap();
        manager.close().unwrap();
        // The garbage file was preserved under a .corrupt-* name
        let mut aside_found = false;
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let name = entry.unwrap().file_name();
            if name.to_string_lossy().contains(".corrupt-") {
                aside_found = true;
            }
        }
        assert!(aside_found);
    }
}

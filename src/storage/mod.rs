//! SQLite storage engine for parley.
//!
//! Owns the single database connection shared by every manager. Handles
//! optional SQLCipher encryption, schema migration on open, and exposes thin
//! query/exec/transaction primitives. Managers write their own SQL; this
//! layer adds no ORM.
//!
//! All access is serialized through one mutex around the connection, so a
//! `Storage` can be shared across the network callback thread and the UI
//! thread behind an `Arc`.

pub mod key;
pub mod migrations;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Params, Row};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use key::{DbKey, DB_KEY_SIZE};
pub use migrations::{MigrationContext, MigrationOutcome, MIGRATIONS};

/// How long a statement waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("wrong encryption key or corrupt database file")]
    WrongKeyOrCorrupt,
    #[error("database file is corrupt: {0}")]
    Corrupt(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("disk full")]
    DiskFull,
    #[error("an encryption key was supplied but this build has no SQLCipher support")]
    EncryptionUnavailable,
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
    #[error("storage is closed")]
    Closed,
    #[error("migration {name} failed: {source}")]
    Migration {
        name: &'static str,
        #[source]
        source: Box<StorageError>,
    },
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("io error: {0}")]
    Io(std::io::Error),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        let code = match &err {
            rusqlite::Error::SqliteFailure(ffi_err, _) => Some(ffi_err.code),
            _ => None,
        };
        match code {
            Some(ErrorCode::DiskFull) => StorageError::DiskFull,
            Some(ErrorCode::PermissionDenied)
            | Some(ErrorCode::ReadOnly)
            | Some(ErrorCode::CannotOpen) => StorageError::PermissionDenied(err.to_string()),
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                StorageError::Corrupt(err.to_string())
            }
            _ => StorageError::Sqlite(err),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(err.to_string()),
            _ => StorageError::Io(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Open options
// ---------------------------------------------------------------------------

/// Whether to build and use the full-text search index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FullTextMode {
    /// Create the index when the SQLite build supports FTS5.
    #[default]
    Auto,
    /// Never create it; search uses substring matching.
    Disabled,
}

#[derive(Debug, Default)]
pub struct OpenOptions {
    pub key: Option<DbKey>,
    pub full_text: FullTextMode,
}

impl OpenOptions {
    pub fn with_key(key: Option<DbKey>) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Main storage handle wrapping the SQLite connection.
#[derive(Debug)]
pub struct Storage {
    conn: Mutex<Option<Connection>>,
    path: Option<PathBuf>,
    encrypted: bool,
    full_text: bool,
}

impl Storage {
    /// Open or create a database file, applying `key` before any schema
    /// access when one is given. Runs all pending migrations.
    pub fn open(path: &Path, key: Option<DbKey>) -> Result<Self, StorageError> {
        Self::open_with(path, OpenOptions::with_key(key))
    }

    pub fn open_with(path: &Path, options: OpenOptions) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;

        let encrypted = match options.key {
            Some(key) => {
                apply_key(&conn, key)?;
                info!(path = %path.display(), "database encryption active");
                true
            }
            None => {
                warn!(
                    path = %path.display(),
                    "no database key supplied, opening WITHOUT encryption at rest"
                );
                false
            }
        };

        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::finish_open(conn, Some(path.to_path_buf()), encrypted, options.full_text)
    }

    /// Unencrypted in-memory database, used by tests and tooling.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open_in_memory_with(FullTextMode::Auto)
    }

    pub fn open_in_memory_with(full_text: FullTextMode) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::finish_open(conn, None, false, full_text)
    }

    fn finish_open(
        conn: Connection,
        path: Option<PathBuf>,
        encrypted: bool,
        full_text_mode: FullTextMode,
    ) -> Result<Self, StorageError> {
        let ctx = MigrationContext {
            full_text_allowed: full_text_mode == FullTextMode::Auto,
        };
        let applied = migrations::run_migrations(&conn, MIGRATIONS, &ctx)?;
        let full_text = ctx.full_text_allowed && migrations::has_table(&conn, "messages_fts")?;
        debug!(applied, full_text, "storage ready");
        if !full_text {
            info!("full-text search unavailable, message search uses substring matching");
        }
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path,
            encrypted,
            full_text,
        })
    }

    /// Release the connection. File-backed plaintext databases checkpoint
    /// and truncate the write-ahead log first. The connection is released
    /// even when the checkpoint fails; later calls return `Closed`.
    pub fn close(&self) -> Result<(), StorageError> {
        let Some(conn) = self.lock().take() else {
            return Ok(());
        };

        let mut checkpoint_err = None;
        if !self.encrypted && self.path.is_some() {
            if let Err(err) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                warn!(error = %err, "wal checkpoint failed during close");
                checkpoint_err = Some(StorageError::from(err));
            }
        }

        // On failure rusqlite hands the connection back; dropping it closes
        // the handle regardless.
        let closed = conn.close().map_err(|(_conn, err)| StorageError::from(err));
        match checkpoint_err {
            Some(err) => Err(err),
            None => closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn has_full_text_search(&self) -> bool {
        self.full_text
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // -----------------------------------------------------------------------
    // Query primitives
    // -----------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        // A panic while holding the lock cannot leave a half-applied write:
        // open transactions are rolled back by Tx::drop.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;
        f(conn)
    }

    /// Execute one statement, returning the number of changed rows.
    pub fn exec<P: Params>(&self, sql: &str, params: P) -> Result<usize, StorageError> {
        self.with_conn(|conn| exec_on(conn, sql, params))
    }

    pub fn exec_batch(&self, sql: &str) -> Result<(), StorageError> {
        self.with_conn(|conn| Ok(conn.execute_batch(sql)?))
    }

    /// Run a query expected to yield at most one row.
    pub fn query_one<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Option<T>, StorageError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_conn(|conn| query_one_on(conn, sql, params, f))
    }

    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>, StorageError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_conn(|conn| query_on(conn, sql, params, f))
    }

    /// Start an immediate (write-locking) transaction. The returned guard
    /// holds the connection until it is committed, rolled back, or dropped;
    /// dropping without committing rolls back.
    pub fn begin_transaction(&self) -> Result<Tx<'_>, StorageError> {
        let guard = self.lock();
        match guard.as_ref() {
            Some(conn) => conn.execute_batch("BEGIN IMMEDIATE")?,
            None => return Err(StorageError::Closed),
        }
        Ok(Tx {
            guard,
            finished: false,
        })
    }

    /// Run `f` inside a transaction, committing on `Ok` and rolling back on
    /// `Err`.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Tx<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let tx = self.begin_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.query_one(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.exec(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Ledger entries in application order.
    pub fn applied_migrations(&self) -> Result<Vec<(String, u64)>, StorageError> {
        self.query(
            "SELECT name, applied_at FROM migrations ORDER BY rowid",
            [],
            |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)),
        )
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// An open transaction holding the storage connection.
pub struct Tx<'a> {
    guard: MutexGuard<'a, Option<Connection>>,
    finished: bool,
}

impl Tx<'_> {
    fn conn(&self) -> Result<&Connection, StorageError> {
        self.guard.as_ref().ok_or(StorageError::Closed)
    }

    pub fn exec<P: Params>(&self, sql: &str, params: P) -> Result<usize, StorageError> {
        exec_on(self.conn()?, sql, params)
    }

    pub fn exec_batch(&self, sql: &str) -> Result<(), StorageError> {
        Ok(self.conn()?.execute_batch(sql)?)
    }

    pub fn query_one<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Option<T>, StorageError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        query_one_on(self.conn()?, sql, params, f)
    }

    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>, StorageError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        query_on(self.conn()?, sql, params, f)
    }

    pub fn last_insert_rowid(&self) -> Result<i64, StorageError> {
        Ok(self.conn()?.last_insert_rowid())
    }

    pub fn commit(mut self) -> Result<(), StorageError> {
        self.conn()?.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), StorageError> {
        self.finished = true;
        self.conn()?.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(conn) = self.guard.as_ref() {
            if let Err(err) = conn.execute_batch("ROLLBACK") {
                warn!(error = %err, "rollback of abandoned transaction failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn exec_on<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<usize, StorageError> {
    let mut stmt = conn.prepare_cached(sql)?;
    Ok(stmt.execute(params)?)
}

fn query_one_on<T, P, F>(
    conn: &Connection,
    sql: &str,
    params: P,
    f: F,
) -> Result<Option<T>, StorageError>
where
    P: Params,
    F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare_cached(sql)?;
    Ok(stmt.query_row(params, f).optional()?)
}

fn query_on<T, P, F>(conn: &Connection, sql: &str, params: P, f: F) -> Result<Vec<T>, StorageError>
where
    P: Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, f)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// Configure the cipher and prove the key can read the file. The key and
/// the statement text are wiped when this returns.
fn apply_key(conn: &Connection, key: DbKey) -> Result<(), StorageError> {
    let cipher = conn
        .query_row("PRAGMA cipher_version", [], |row| row.get::<_, String>(0))
        .optional()
        .unwrap_or(None);
    if cipher.is_none() {
        return Err(StorageError::EncryptionUnavailable);
    }

    {
        let statement = key.pragma_statement();
        conn.execute_batch(statement.as_str())?;
    }
    drop(key);

    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(|err| match StorageError::from(err) {
        StorageError::Corrupt(_) => StorageError::WrongKeyOrCorrupt,
        other => other,
    })?;
    Ok(())
}

/// Read a TEXT uuid column.
pub(crate) fn column_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn column_opt_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        Uuid::parse_str(&t)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Read a nullable INTEGER timestamp column.
pub(crate) fn column_opt_millis(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(|v| v as u64))
}

/// Resolve the database path: `{data_dir}/parley.db`.
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("parley.db")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

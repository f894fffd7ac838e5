//! `SQLite`-backed store shared by the ledger, designated accounts, evidence,
//! and reconciliation.
//!
//! The database runs in WAL mode. A single [`LedgerStore`] wraps one
//! connection behind a mutex; several stores (or processes) may open the same
//! file, in which case `SQLite`'s write lock serialises writers.

// SQLite returns i64 for row IDs and counts, but they're always non-negative.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

use super::journal::JournalError;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The journal failed validation before reaching storage.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// No journal exists at the requested position.
    #[error("journal not found: org_id={org_id} seq={seq}")]
    JournalNotFound {
        /// Organisation identifier.
        org_id: String,
        /// Requested sequence number.
        seq: u64,
    },

    /// Hash chain verification failed.
    #[error("hash chain broken for org {org_id} at seq {seq}: {details}")]
    HashChainBroken {
        /// Organisation identifier.
        org_id: String,
        /// Sequence number where the chain broke.
        seq: u64,
        /// Details about the failure.
        details: String,
    },

    /// A stored row holds a value the ledger never writes.
    #[error("corrupt row in {table}: {details}")]
    CorruptRow {
        /// Table name.
        table: &'static str,
        /// Details about the failure.
        details: String,
    },
}

/// Statistics about the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerStats {
    /// Total number of journals across all organisations.
    pub journal_count: u64,

    /// Total number of postings.
    pub posting_count: u64,

    /// Number of distinct organisations with at least one journal.
    pub org_count: u64,

    /// Database file size in bytes.
    pub db_size_bytes: u64,
}

/// Handle to the taxvault database.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct LedgerStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl LedgerStore {
    /// Opens or creates a store at the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::initialize_connection(&conn)?;

        tracing::debug!(path = %path.display(), "opened ledger store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Opens a store and applies a custom busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open_with_busy_timeout(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let store = Self::open(path)?;
        store.lock().busy_timeout(busy_timeout)?;
        Ok(store)
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    fn initialize_connection(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Path of the backing file, `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Locks the underlying connection.
    ///
    /// A poisoned mutex is recovered: every mutation runs inside a
    /// transaction, so a panic mid-write leaves nothing half-applied.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gets statistics about the store.
    ///
    /// # Errors
    ///
    /// Returns an error if statistics cannot be gathered.
    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let conn = self.lock();

        let journal_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM journals", [], |row| row.get(0))?;
        let posting_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM postings", [], |row| row.get(0))?;
        let org_count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT org_id) FROM journals",
            [],
            |row| row.get(0),
        )?;

        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(LedgerStats {
            journal_count: journal_count as u64,
            posting_count: posting_count as u64,
            org_count: org_count as u64,
            db_size_bytes: (page_count * page_size) as u64,
        })
    }

    /// Verifies that WAL mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal mode cannot be queried.
    pub fn verify_wal_mode(&self) -> Result<bool, LedgerError> {
        let conn = self.lock();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        Ok(mode.eq_ignore_ascii_case("wal"))
    }
}

/// Converts a timestamp to the millisecond representation stored on disk.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Converts a stored millisecond value back into a timestamp.
pub(crate) fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ms))
}

/// Returns `true` if the error is a UNIQUE constraint violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

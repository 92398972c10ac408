//! Storage layer
//!
//! - Storage trait definitions
//! - SQLite store for the TSS server
//! - SQLite store for a key-share node

pub mod ksn;
pub mod traits;
pub mod tss;

pub use ksn::SqliteKsnStore;
pub use traits::{KeygenRecord, KsnStore, NewWallet, StorageError, StorageResult, TssStore};
pub use tss::SqliteTssStore;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::time::Duration;

/// SQLite extended codes for PRIMARY KEY and UNIQUE violations
const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = 1555;
const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;

pub(crate) fn file_pool<P: AsRef<Path>>(db_path: P) -> Result<Pool<SqliteConnectionManager>, StorageError> {
    if let Some(parent) = db_path.as_ref().parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")
    });
    Pool::builder()
        .max_size(10)
        .build(manager)
        .map_err(|e| StorageError::Connection(e.to_string()))
}

/// One connection only: every pooled `:memory:` connection is its own database
pub(crate) fn memory_pool() -> Result<Pool<SqliteConnectionManager>, StorageError> {
    let manager = SqliteConnectionManager::memory()
        .with_init(|conn| conn.pragma_update(None, "foreign_keys", "ON"));
    Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| StorageError::Connection(e.to_string()))
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == SQLITE_CONSTRAINT_PRIMARYKEY || e.extended_code == SQLITE_CONSTRAINT_UNIQUE
    )
}

pub(crate) fn db_err(err: rusqlite::Error) -> StorageError {
    StorageError::Database(err.to_string())
}

pub(crate) fn millis(at: &DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Parse a TEXT column into a typed value
pub(crate) fn parse_column<T: std::str::FromStr<Err = String>>(
    idx: usize,
    raw: String,
) -> rusqlite::Result<T> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(StorageError::InvalidData(e)),
        )
    })
}

pub(crate) fn parse_uuid(idx: usize, raw: String) -> rusqlite::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

//! Shared persistent job store.
//!
//! All coordination between workers happens through a single SQLite file
//! in WAL mode. Every multi-statement mutation runs inside a write-intent
//! (`BEGIN IMMEDIATE`) transaction so that concurrent claim attempts
//! serialize at the store instead of racing.

mod claim;
mod snapshot;
mod store;

pub use claim::ClaimOutcome;
pub use snapshot::Snapshot;
pub use store::JobStore;

pub(crate) use store::{format_ts, parse_ts};

use thiserror::Error;

/// Reserved bookkeeping columns, in canonical order. Every other column
/// in the `jobs` table is a user parameter.
pub const RESERVED_COLUMNS: [&str; 10] = [
    "JOBSCHEDULER_JOB_ID",
    "JOBSCHEDULER_STATUS",
    "JOBSCHEDULER_PRIORITY",
    "JOBSCHEDULER_ESTIMATE_TIME",
    "JOBSCHEDULER_ELAPSED_TIME",
    "JOBSCHEDULER_DEPENDS_ON",
    "JOBSCHEDULER_CREATED_AT",
    "JOBSCHEDULER_STARTED_AT",
    "JOBSCHEDULER_FINISHED_AT",
    "JOBSCHEDULER_ERROR_MESSAGE",
];

/// Prefix that marks a column as reserved rather than a user parameter.
pub const RESERVED_PREFIX: &str = "JOBSCHEDULER_";

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// New rows introduce or omit a param column vs. the existing table.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The 30 s busy timeout was exceeded on a contended lock. The caller
    /// decides whether to retry or abort.
    #[error("store lock timeout")]
    LockTimeout,

    /// Duplicate job id on insert, or a referenced predecessor is missing.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The requested job does not exist.
    #[error("job not found: {0}")]
    NotFound(String),

    /// The store file has no `jobs` table yet.
    #[error("store is not initialized (no jobs table); import a CSV first")]
    Uninitialized,

    /// A column name that cannot be used safely in the schema.
    #[error("invalid column name: '{0}'")]
    InvalidColumn(String),

    /// A row that violates the data model (e.g. unknown status text).
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Any other database failure. Fatal for the worker.
    #[error(transparent)]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_lock_error(&err) {
            StoreError::LockTimeout
        } else {
            StoreError::Database(err)
        }
    }
}

/// SQLite reports lock contention as SQLITE_BUSY with one of a few
/// messages; anything else is a real database failure.
fn is_lock_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let msg = db.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

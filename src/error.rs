//! Error taxonomy shared by the sync engine and the dedup engine.
//!
//! Transient infrastructure failures ([`SyncError::Unavailable`],
//! [`SyncError::Database`]) are retried by [`crate::retry::RetryPolicy`].
//! Everything else is surfaced immediately. Version conflicts are not
//! errors at all; see [`crate::reconcile::BlockOutcome`].

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the library.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The graph store, candidate store, or queue could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A queue message that can never be processed, regardless of retries.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<SyncError>,
    },

    #[error("index error: {0}")]
    Index(String),

    #[error("queue error: {0}")]
    Queue(String),

    /// A request the backend refuses on semantic grounds (e.g. moving a
    /// candidate out of a terminal status).
    #[error("invalid operation: {0}")]
    Invalid(String),
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Unavailable(_) => true,
            SyncError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ) || is_sqlite_busy(e),
            SyncError::Queue(_) => true,
            _ => false,
        }
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED surface as database errors with codes 5 and 6.
fn is_sqlite_busy(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}

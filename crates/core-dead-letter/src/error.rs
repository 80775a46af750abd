//! Error types for the dead-letter store

use rusqlite::ErrorCode;
use taskguard_core_resilience::{Classify, ErrorKind};
use thiserror::Error;

/// Errors produced by the dead-letter store
#[derive(Debug, Error)]
pub enum DeadLetterError {
    /// Underlying SQLite failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Workflow state could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An entry for this task already exists
    #[error("Task '{0}' is already in the dead-letter store")]
    DuplicateTask(String),

    /// A stored timestamp is not valid RFC 3339
    #[error("Invalid timestamp in column {column}: '{value}'")]
    InvalidTimestamp { column: &'static str, value: String },

    /// The blocking worker running the query panicked or was cancelled
    #[error("Blocking worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// The store was closed
    #[error("Dead-letter store is closed")]
    Closed,
}

impl Classify for DeadLetterError {
    fn kind(&self) -> ErrorKind {
        match self {
            DeadLetterError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                ErrorKind::Transient
            }
            DeadLetterError::Sqlite(_) | DeadLetterError::InvalidTimestamp { .. } => {
                ErrorKind::Permanent
            }
            DeadLetterError::Serialization(_) | DeadLetterError::DuplicateTask(_) => {
                ErrorKind::InvalidInput
            }
            DeadLetterError::Worker(_) => ErrorKind::Transient,
            DeadLetterError::Closed => ErrorKind::PoolClosed,
        }
    }
}

pub type Result<T> = std::result::Result<T, DeadLetterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_database_is_transient() {
        let busy = DeadLetterError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert_eq!(busy.kind(), ErrorKind::Transient);

        let missing = DeadLetterError::Sqlite(rusqlite::Error::QueryReturnedNoRows);
        assert_eq!(missing.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn test_caller_errors() {
        assert_eq!(
            DeadLetterError::DuplicateTask("t-1".into()).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(DeadLetterError::Closed.kind(), ErrorKind::PoolClosed);
        assert_eq!(
            DeadLetterError::DuplicateTask("t-1".into()).to_string(),
            "Task 't-1' is already in the dead-letter store"
        );
    }
}

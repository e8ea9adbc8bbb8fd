//! Error types for the insights store

use rusqlite::ErrorCode;
use thiserror::Error;

/// Main error type for the store
#[derive(Error, Debug)]
pub enum Error {
    /// Backing store error (connection, constraint, busy, ...)
    ///
    /// Propagated unmodified. Retry policy belongs to the caller.
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Input rejected before any write was attempted
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The permission filter could not produce a deny-list
    #[error("Permission filter error: {0}")]
    Permission(String),

    /// The caller's cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// A transaction handle was used after commit or rollback
    #[error("Transaction already finished")]
    TransactionFinished,

    /// A stored row could not be decoded
    #[error("Corrupted row: {0}")]
    CorruptedRow(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking store task panicked or was aborted
    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Whether the error is a transient contention error the caller may retry
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Store(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Whether the store aborted the statement because of an interrupt
    pub(crate) fn is_interrupt(&self) -> bool {
        matches!(
            self,
            Error::Store(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::OperationInterrupted
        )
    }

    /// Short label used for the errors metric
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Store(_) => "store",
            Error::Validation(_) => "validation",
            Error::Permission(_) => "permission",
            Error::Cancelled => "cancelled",
            Error::TransactionFinished => "transaction_finished",
            Error::CorruptedRow(_) => "corrupted_row",
            Error::Configuration(_) => "configuration",
            Error::Io(_) => "io",
            Error::Join(_) => "join",
        }
    }
}

/// Validation errors
///
/// Raised synchronously for the whole input before a transaction begins.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Series ID is empty
    #[error("series ID must not be empty")]
    EmptySeriesId,

    /// Repository name and ID must be given together
    #[error("repository name and ID must be mutually specified (series {series_id})")]
    MismatchedRepository {
        /// Series the offending sample belongs to
        series_id: String,
    },

    /// Repository name is the empty string
    #[error("repository name must not be empty (series {series_id})")]
    EmptyRepositoryName {
        /// Series the offending sample belongs to
        series_id: String,
    },

    /// Sample value is NaN or infinite
    #[error("sample value {value} for series {series_id} is not finite")]
    NonFiniteValue {
        /// Series the offending sample belongs to
        series_id: String,
        /// The rejected value
        value: f64,
    },

    /// Repository name pattern does not compile
    #[error("invalid repository pattern {pattern:?}: {message}")]
    InvalidPattern {
        /// The pattern as given
        pattern: String,
        /// Compiler message
        message: String,
    },

    /// Internal series ID must be positive
    #[error("invalid internal series ID {0}")]
    InvalidSeriesId(i64),

    /// Required field is missing
    #[error("missing required field: {0}")]
    MissingField(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_transient() {
        let busy = Error::Store(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn test_validation_converts() {
        let err: Error = ValidationError::EmptySeriesId.into();
        assert_eq!(err.kind(), "validation");
        assert!(err.to_string().contains("series ID"));
    }
}

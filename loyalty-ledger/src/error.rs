//! Error types for the jewels ledger

use crate::types::UserId;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed append request; rejected before any write
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    /// Redemption below the configured minimum
    #[error("Redemption of {requested} jewels is below the minimum of {minimum}")]
    BelowMinimumThreshold {
        /// Jewels requested
        requested: i64,
        /// Configured minimum
        minimum: i64,
    },

    /// Redemption exceeds the active balance
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Jewels requested
        requested: i64,
        /// Current active balance
        available: i64,
    },

    /// Per-user lock not acquired in time; safe to retry
    #[error("Conflicting write in progress for user {user_id}, retry later")]
    RetryableConflict {
        /// Contended account
        user_id: UserId,
    },

    /// Some users could not be swept this cycle
    #[error("Sweep failed for {failed_users} user(s): {first_error}")]
    SweepPartialFailure {
        /// Users left for the next cycle
        failed_users: usize,
        /// First failure message
        first_error: String,
    },

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Entry not found
    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    /// Invariant violation (conservation, inconsistent log, stale summary)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Concurrency error (sweeper mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Caller may retry the same request with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RetryableConflict { .. })
    }

    /// Business-rule rejection safe to show to the guest verbatim
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::BelowMinimumThreshold { .. } | Error::InsufficientBalance { .. }
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let conflict = Error::RetryableConflict {
            user_id: UserId::random(),
        };
        assert!(conflict.is_retryable());
        assert!(!conflict.is_user_facing());

        let short = Error::InsufficientBalance {
            requested: 120,
            available: 30,
        };
        assert!(short.is_user_facing());
        assert!(!short.is_retryable());
        assert_eq!(
            short.to_string(),
            "Insufficient balance: requested 120, available 30"
        );

        assert!(!Error::InvalidEntry("zero delta".into()).is_retryable());
    }
}

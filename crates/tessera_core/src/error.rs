//! Error types for Tessera core.

use crate::types::TransactionId;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Tessera core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tessera_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Value encoding or decoding failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The transaction log is corrupted or was written by an incompatible version.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A unit of work collided with a concurrent one. Retryable.
    #[error("transaction conflict: {reason}")]
    TransactionConflict {
        /// Why the conflict happened.
        reason: String,
    },

    /// The exchange was already committed or rolled back.
    #[error("transaction already finished ({state})")]
    TransactionFinished {
        /// Terminal state the exchange is in.
        state: String,
    },

    /// The transaction log has no open transaction with this id.
    #[error("unknown or finished transaction {txid}")]
    UnknownTransaction {
        /// The transaction id.
        txid: TransactionId,
    },

    /// An index failed fatally; it will not serve queries until restarted.
    #[error("index {index} failed: {message}")]
    IndexFailed {
        /// Name of the index.
        index: String,
        /// Description of the failure.
        message: String,
    },

    /// An index name was not registered.
    #[error("index not found: {name}")]
    IndexNotFound {
        /// Name that was looked up.
        name: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Caller supplied an invalid argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the argument problem.
        message: String,
    },

    /// Work was cancelled before it finished.
    #[error("cancelled")]
    Cancelled,

    /// The database is closed.
    #[error("database is closed")]
    Closed,
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a WAL corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates a transaction conflict error.
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::TransactionConflict {
            reason: reason.into(),
        }
    }

    /// Creates a transaction finished error.
    pub fn finished(state: impl Into<String>) -> Self {
        Self::TransactionFinished {
            state: state.into(),
        }
    }

    /// Creates an index failure error.
    pub fn index_failed(index: impl Into<String>, message: impl Into<String>) -> Self {
        Self::IndexFailed {
            index: index.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true if re-running the whole unit of work may succeed.
    ///
    /// Only [`CoreError::TransactionConflict`] is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransactionConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(CoreError::conflict("write skew").is_retryable());
        assert!(!CoreError::finished("committed").is_retryable());
        assert!(!CoreError::wal_corruption("bad tag").is_retryable());
        assert!(!CoreError::Cancelled.is_retryable());
    }

    #[test]
    fn messages_name_the_problem() {
        let err = CoreError::index_failed("by_name", "missing payload");
        assert_eq!(err.to_string(), "index by_name failed: missing payload");

        let err = CoreError::UnknownTransaction {
            txid: TransactionId::new(7),
        };
        assert_eq!(err.to_string(), "unknown or finished transaction tx:7");
    }
}

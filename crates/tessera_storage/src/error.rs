//! Backend errors.

use std::io;
use thiserror::Error;

/// Result of a backend call.
pub type StorageResult<T> = Result<T, StorageError>;

/// Why a backend call failed.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The operating system refused a read, write, sync or truncate.
    #[error("backend I/O failed: {0}")]
    Io(#[from] io::Error),

    /// A read asked for bytes the backend does not hold.
    #[error("read of {len} bytes at offset {offset} ends past the backend size {size}")]
    ReadPastEnd {
        /// First byte asked for.
        offset: u64,
        /// Bytes asked for.
        len: usize,
        /// Backend size at the time.
        size: u64,
    },

    /// `truncate` was asked to grow the backend.
    #[error("cannot truncate to {requested} bytes, backend holds {size}")]
    TruncateBeyondEnd {
        /// Size asked for.
        requested: u64,
        /// Backend size at the time.
        size: u64,
    },

    /// Stored bytes cannot be decoded.
    #[error("corrupted backend contents: {0}")]
    Corrupted(String),
}

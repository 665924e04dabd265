//! Error types for the local store.

use crate::types::SequenceNo;
use std::io;
use thiserror::Error;

/// Result type for local store operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the record table, the change log and the local store.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tidesync_storage::StorageError),

    /// I/O error outside a backend (store directory, lock file).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame body could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// A frame's checksum does not match its contents.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Offset of the frame.
        offset: u64,
        /// Checksum stored in the frame.
        expected: u32,
        /// Checksum computed over the frame.
        actual: u32,
    },

    /// A store file is structurally invalid.
    #[error("store corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,

    /// The change log has no entry with this sequence number.
    #[error("no change-log entry {0}")]
    UnknownEntry(SequenceNo),

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the local medium is unavailable or corrupt.
    ///
    /// These failures are fatal to the operation that hit them and are never
    /// retried silently.
    #[must_use]
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            CoreError::Storage(_)
                | CoreError::Io(_)
                | CoreError::Codec { .. }
                | CoreError::ChecksumMismatch { .. }
                | CoreError::Corrupted { .. }
                | CoreError::StoreLocked
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_failures() {
        let unavailable =
            CoreError::from(tidesync_storage::StorageError::Unavailable("gone".into()));
        assert!(unavailable.is_storage_failure());
        assert!(CoreError::corrupted("bad magic").is_storage_failure());
        assert!(!CoreError::UnknownEntry(SequenceNo::new(3)).is_storage_failure());
        assert!(!CoreError::invalid_operation("nope").is_storage_failure());
    }

    #[test]
    fn error_display() {
        let err = CoreError::ChecksumMismatch {
            offset: 11,
            expected: 0xdead_beef,
            actual: 0x0000_0001,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch at offset 11: expected deadbeef, got 00000001"
        );
        assert_eq!(
            CoreError::UnknownEntry(SequenceNo::new(9)).to_string(),
            "no change-log entry seq:9"
        );
    }
}

//! Error types for the sync engine.

use thiserror::Error;
use tidesync_sync_protocol::{GatewayError, ResolveError};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The local store failed. Fatal to the run; never retried silently.
    #[error("storage failure: {0}")]
    Storage(#[from] tidesync_core::CoreError),

    /// The remote could not be reached.
    #[error("network failure: {message}")]
    Network {
        /// Error message.
        message: String,
    },

    /// The remote refused a change for good.
    #[error("rejected by server: {reason}")]
    Rejected {
        /// Reason the server gave.
        reason: String,
    },

    /// A conflict resolver gave up or returned an invalid decision.
    #[error("unresolved conflict: {0}")]
    ConflictUnresolved(#[from] ResolveError),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// A gateway call took longer than the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// The background worker has shut down.
    #[error("sync worker stopped")]
    WorkerStopped,
}

impl SyncError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network { .. } | SyncError::Timeout)
    }
}

impl From<GatewayError> for SyncError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Network(message) => SyncError::Network { message },
            GatewayError::Rejected(reason) => SyncError::Rejected { reason },
        }
    }
}

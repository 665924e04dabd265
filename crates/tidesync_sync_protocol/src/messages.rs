//! Push results exchanged with a remote gateway.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tidesync_core::Record;

/// What the remote did with a pushed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PushOutcome {
    /// The change was stored; this is the server's copy, with the version
    /// the server assigned.
    Accepted(Record),
    /// The server holds a diverged version of the record.
    Conflict(Record),
}

impl PushOutcome {
    /// Returns the server record carried by the outcome.
    #[must_use]
    pub fn server_record(&self) -> &Record {
        match self {
            PushOutcome::Accepted(record) | PushOutcome::Conflict(record) => record,
        }
    }
}

/// Failure of a gateway call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum GatewayError {
    /// The remote could not be reached or did not answer. Transient.
    #[error("network failure: {0}")]
    Network(String),

    /// The remote refused the change for good.
    #[error("rejected by server: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// Returns true for failures worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Network(_))
    }
}

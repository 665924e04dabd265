//! Resolver errors.

use thiserror::Error;

/// A conflict that could not be turned into a decision.
///
/// The built-in resolvers never produce this. Custom resolvers can, and so
/// can a `Merge` that does not describe the conflicted record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("conflict on {record_id} unresolved: {message}")]
pub struct ResolveError {
    /// Record the conflict is about.
    pub record_id: String,
    /// Why resolution failed.
    pub message: String,
}

impl ResolveError {
    /// Creates a resolve error.
    pub fn new(record_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            message: message.into(),
        }
    }
}

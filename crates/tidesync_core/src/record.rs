//! Records, change-log entries and dead letters.

use crate::types::{Payload, RecordId, SequenceNo, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An application record as held in the local table.
///
/// Deletion never removes a record outright: it leaves a tombstone
/// (`deleted == true`) so the deletion can propagate. The tombstone is purged
/// once the remote confirms it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier.
    pub id: RecordId,
    /// Logical clock of this record.
    pub version: Version,
    /// Opaque structured value.
    pub payload: Payload,
    /// Time of the write that produced this state.
    pub updated_at: Timestamp,
    /// Tombstone marker.
    pub deleted: bool,
}

impl Record {
    /// Creates a live record.
    pub fn new(
        id: impl Into<RecordId>,
        version: Version,
        payload: Payload,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            version,
            payload,
            updated_at,
            deleted: false,
        }
    }

    /// Returns the tombstone that deleting this record at `at` produces.
    ///
    /// The last payload is kept so conflict resolution can still see it.
    #[must_use]
    pub fn tombstone(&self, at: Timestamp) -> Self {
        Self {
            id: self.id.clone(),
            version: self.version.next(),
            payload: self.payload.clone(),
            updated_at: at,
            deleted: true,
        }
    }

    /// Returns true for tombstones.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }
}

/// Kind of mutation recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// The record did not exist before this write.
    Create,
    /// An existing record was changed.
    Update,
    /// The record was tombstoned.
    Delete,
}

impl Operation {
    /// Folds an earlier pending operation with a later one on the same record.
    ///
    /// The server never saw the earlier one, so a create followed by edits is
    /// still a create, and re-creating a pending delete is an update of the
    /// server's copy. A create followed by a delete stays a delete, since the
    /// create may already have reached the remote; a create that certainly
    /// did not is dropped instead, see
    /// [`ChangeLog::discard_unsent_create`](crate::ChangeLog::discard_unsent_create).
    #[must_use]
    pub fn coalesce(self, later: Operation) -> Operation {
        match (self, later) {
            (Operation::Create, Operation::Update) => Operation::Create,
            (Operation::Delete, Operation::Create) => Operation::Update,
            (_, later) => later,
        }
    }

    /// Operation that writes `record` on top of a previous state.
    #[must_use]
    pub fn for_write(previous: Option<&Record>, record: &Record) -> Operation {
        if record.deleted {
            Operation::Delete
        } else {
            match previous {
                Some(prev) if !prev.deleted => Operation::Update,
                _ => Operation::Create,
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Synchronization state of a change-log entry.
///
/// Only the sync coordinator moves entries out of `Pending`. `InFlight` is a
/// runtime state and is never persisted: a reopened log sees every surviving
/// entry as `Pending`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    /// Waiting to be pushed.
    #[default]
    Pending,
    /// Part of the batch currently being pushed.
    InFlight,
    /// Confirmed by the remote; removed from the log.
    Synced,
    /// Rejected by the remote; moved to the dead letters.
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Pending => "pending",
            SyncState::InFlight => "in-flight",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A mutation waiting to be confirmed by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Position in the log.
    pub sequence: SequenceNo,
    /// Record this entry mutates.
    pub record_id: RecordId,
    /// Kind of mutation.
    pub operation: Operation,
    /// Record state at the time of the write.
    pub snapshot: Record,
    /// Current synchronization state.
    #[serde(skip)]
    pub sync_state: SyncState,
}

impl ChangeLogEntry {
    /// Returns true while the entry waits to be pushed.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.sync_state == SyncState::Pending
    }

    /// Returns true while the entry is part of a sync batch.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.sync_state == SyncState::InFlight
    }
}

/// A change the remote rejected permanently.
///
/// Dead letters are out of the retry path. They stay in the change-log file
/// until the application dismisses or requeues them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The rejected entry, in state [`SyncState::Failed`].
    pub entry: ChangeLogEntry,
    /// Reason the remote gave.
    pub reason: String,
    /// When the entry was dead-lettered.
    pub at: Timestamp,
}

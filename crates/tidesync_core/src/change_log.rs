//! Change log of local mutations awaiting remote confirmation.
//!
//! The log is a frame file on a [`StorageBackend`] replayed into memory on
//! open. Every state change that must survive a restart is a frame:
//!
//! | kind | body | effect on replay |
//! |---|---|---|
//! | Append | entry, superseded seq | insert entry, drop the superseded one |
//! | Remove | seq | entry synced, drop it |
//! | DeadLetter | seq, reason, time | move entry to the dead letters |
//! | Dismiss | seq | drop dead letter |
//! | Checkpoint | next seq | restore the sequence counter after a trim |
//! | Discard | seq, record | drop a create the remote never saw |
//!
//! Coalescing writes the replacement entry and the removal of the entry it
//! supersedes in the same frame, so a crash can never leave both or neither.
//!
//! `InFlight` exists only in memory. A reopened log sees every entry as
//! `Pending`, and treats every entry as possibly offered to the remote.

use crate::error::{CoreError, CoreResult};
use crate::frame::{encode_frame, FrameReader, RawFrame};
use crate::record::{ChangeLogEntry, DeadLetter, Operation, Record, SyncState};
use crate::types::{RecordId, SequenceNo, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tidesync_storage::StorageBackend;
use tracing::{debug, warn};

/// Magic bytes of change-log frames.
pub const LOG_MAGIC: [u8; 4] = *b"TSCL";

const KIND_APPEND: u8 = 1;
const KIND_REMOVE: u8 = 2;
const KIND_DEAD_LETTER: u8 = 3;
const KIND_DISMISS: u8 = 4;
const KIND_CHECKPOINT: u8 = 5;
const KIND_DISCARD: u8 = 6;

#[derive(Serialize, Deserialize)]
struct AppendBody {
    entry: ChangeLogEntry,
    supersedes: Option<SequenceNo>,
}

#[derive(Serialize, Deserialize)]
struct SequenceBody {
    sequence: SequenceNo,
}

#[derive(Serialize, Deserialize)]
struct DeadLetterBody {
    sequence: SequenceNo,
    reason: String,
    at: Timestamp,
}

#[derive(Serialize, Deserialize)]
struct DiscardBody {
    sequence: SequenceNo,
    record_id: RecordId,
}

#[derive(Serialize, Deserialize)]
struct CheckpointBody {
    next_sequence: SequenceNo,
}

struct LogInner {
    backend: Box<dyn StorageBackend>,
    entries: BTreeMap<SequenceNo, ChangeLogEntry>,
    dead_letters: BTreeMap<SequenceNo, DeadLetter>,
    next_sequence: SequenceNo,
    /// Frames written since the last checkpoint.
    frames: usize,
    /// Entries written by this process and never handed to a batch.
    unsent: BTreeSet<SequenceNo>,
    /// Records whose unsent create was discarded since the last trim.
    discarded: BTreeSet<RecordId>,
}

impl LogInner {
    fn write<T: Serialize>(&mut self, kind: u8, body: &T, sync: bool) -> CoreResult<()> {
        let frame = encode_frame(LOG_MAGIC, kind, body)?;
        self.backend.append(&frame)?;
        if sync {
            self.backend.sync()?;
        }
        self.frames += 1;
        Ok(())
    }

    fn pending_for(&self, id: &RecordId) -> Option<&ChangeLogEntry> {
        self.entries
            .values()
            .find(|e| &e.record_id == id && e.is_pending())
    }

    fn in_flight_for(&self, id: &RecordId) -> bool {
        self.entries
            .values()
            .any(|e| &e.record_id == id && e.is_in_flight())
    }

    fn apply_frame(&mut self, frame: &RawFrame) -> CoreResult<()> {
        match frame.kind {
            KIND_APPEND => {
                let body: AppendBody = frame.decode()?;
                if let Some(old) = body.supersedes {
                    self.entries.remove(&old);
                }
                let mut entry = body.entry;
                entry.sync_state = SyncState::Pending;
                if entry.sequence >= self.next_sequence {
                    self.next_sequence = entry.sequence.next();
                }
                self.discarded.remove(&entry.record_id);
                self.entries.insert(entry.sequence, entry);
            }
            KIND_DISCARD => {
                let body: DiscardBody = frame.decode()?;
                self.entries.remove(&body.sequence);
                self.discarded.insert(body.record_id);
            }
            KIND_REMOVE => {
                let body: SequenceBody = frame.decode()?;
                self.entries.remove(&body.sequence);
            }
            KIND_DEAD_LETTER => {
                let body: DeadLetterBody = frame.decode()?;
                let Some(mut entry) = self.entries.remove(&body.sequence) else {
                    return Err(CoreError::corrupted(format!(
                        "dead letter for unknown entry {} at offset {}",
                        body.sequence, frame.offset
                    )));
                };
                entry.sync_state = SyncState::Failed;
                self.dead_letters.insert(
                    body.sequence,
                    DeadLetter {
                        entry,
                        reason: body.reason,
                        at: body.at,
                    },
                );
            }
            KIND_DISMISS => {
                let body: SequenceBody = frame.decode()?;
                self.dead_letters.remove(&body.sequence);
            }
            KIND_CHECKPOINT => {
                let body: CheckpointBody = frame.decode()?;
                if body.next_sequence > self.next_sequence {
                    self.next_sequence = body.next_sequence;
                }
                return Ok(());
            }
            other => {
                return Err(CoreError::corrupted(format!(
                    "unknown change-log frame kind {other} at offset {}",
                    frame.offset
                )));
            }
        }
        self.frames += 1;
        Ok(())
    }

    /// Reverts an in-flight entry, folding it into a newer pending entry for
    /// the same record if one was written meanwhile.
    fn revert(&mut self, seq: SequenceNo, sync: bool) -> CoreResult<()> {
        let Some(entry) = self.entries.get(&seq) else {
            return Err(CoreError::UnknownEntry(seq));
        };
        if !entry.is_in_flight() {
            return Ok(());
        }

        let newer = self
            .entries
            .range(seq.next()..)
            .map(|(_, e)| e)
            .find(|e| e.record_id == entry.record_id && e.is_pending())
            .cloned();

        match newer {
            None => {
                if let Some(entry) = self.entries.get_mut(&seq) {
                    entry.sync_state = SyncState::Pending;
                }
            }
            Some(mut newer) => {
                newer.operation = entry.operation.coalesce(newer.operation);
                let body = AppendBody {
                    entry: newer,
                    supersedes: Some(seq),
                };
                self.write(KIND_APPEND, &body, sync)?;
                debug!(
                    superseded = %seq,
                    sequence = %body.entry.sequence,
                    "folded reverted entry into newer pending entry"
                );
                self.entries.remove(&seq);
                self.unsent.remove(&body.entry.sequence);
                self.entries.insert(body.entry.sequence, body.entry);
            }
        }
        Ok(())
    }
}

/// Durable, ordered log of mutations not yet confirmed by the remote.
///
/// Holds at most one `Pending` entry per record; see [`append`](Self::append).
pub struct ChangeLog {
    inner: Mutex<LogInner>,
    sync_on_write: bool,
}

impl ChangeLog {
    /// Opens a change log over `backend`, replaying its frames.
    ///
    /// # Errors
    ///
    /// Fails if a complete frame is corrupt or the backend fails. A torn
    /// final frame is truncated away.
    pub fn open(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> CoreResult<Self> {
        let mut inner = LogInner {
            backend,
            entries: BTreeMap::new(),
            dead_letters: BTreeMap::new(),
            next_sequence: SequenceNo::FIRST,
            frames: 0,
            unsent: BTreeSet::new(),
            discarded: BTreeSet::new(),
        };

        let mut frames = Vec::new();
        let (valid_end, size) = {
            let mut reader = FrameReader::new(inner.backend.as_ref(), LOG_MAGIC)?;
            for frame in reader.by_ref() {
                frames.push(frame?);
            }
            (reader.valid_end(), reader.size())
        };
        for frame in &frames {
            inner.apply_frame(frame)?;
        }

        if valid_end < size {
            warn!(valid_end, size, "truncating torn tail of change log");
            inner.backend.truncate(valid_end)?;
        }

        debug!(
            entries = inner.entries.len(),
            dead_letters = inner.dead_letters.len(),
            next_sequence = %inner.next_sequence,
            "change log opened"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            sync_on_write,
        })
    }

    /// Records a mutation of `snapshot.id`.
    ///
    /// If the record already has a `Pending` entry, the new entry replaces
    /// it and the two operations are folded with [`Operation::coalesce`]. An
    /// `InFlight` entry is never replaced; the new entry queues behind it.
    pub fn append(&self, operation: Operation, snapshot: Record) -> CoreResult<SequenceNo> {
        let mut inner = self.inner.lock();

        let (operation, supersedes) = match inner.pending_for(&snapshot.id) {
            Some(old) => (old.operation.coalesce(operation), Some(old.sequence)),
            None => (operation, None),
        };

        let sequence = inner.next_sequence;
        let body = AppendBody {
            entry: ChangeLogEntry {
                sequence,
                record_id: snapshot.id.clone(),
                operation,
                snapshot,
                sync_state: SyncState::Pending,
            },
            supersedes,
        };
        inner.write(KIND_APPEND, &body, self.sync_on_write)?;

        inner.next_sequence = sequence.next();
        let unsent = match supersedes {
            Some(old) => {
                inner.entries.remove(&old);
                inner.unsent.remove(&old)
            }
            None => true,
        };
        if unsent {
            inner.unsent.insert(sequence);
        }
        inner.discarded.remove(&body.entry.record_id);
        inner.entries.insert(sequence, body.entry);
        Ok(sequence)
    }

    /// Drops the `Pending` create of `id` if no batch ever took it.
    ///
    /// Returns the dropped sequence, or `None` when the record has no such
    /// entry. Entries replayed from disk are never dropped: the remote may
    /// have stored them before the process went down. The record is
    /// remembered until the next [`trim`](Self::trim); see
    /// [`discarded`](Self::discarded).
    pub fn discard_unsent_create(&self, id: &RecordId) -> CoreResult<Option<SequenceNo>> {
        let mut inner = self.inner.lock();
        let Some(seq) = inner
            .pending_for(id)
            .filter(|e| e.operation == Operation::Create)
            .map(|e| e.sequence)
        else {
            return Ok(None);
        };
        if !inner.unsent.contains(&seq) {
            return Ok(None);
        }

        let body = DiscardBody {
            sequence: seq,
            record_id: id.clone(),
        };
        inner.write(KIND_DISCARD, &body, self.sync_on_write)?;
        inner.entries.remove(&seq);
        inner.unsent.remove(&seq);
        inner.discarded.insert(body.record_id);
        Ok(Some(seq))
    }

    /// Records whose unsent create was discarded since the last trim and
    /// that have no entry now.
    #[must_use]
    pub fn discarded(&self) -> Vec<RecordId> {
        self.inner.lock().discarded.iter().cloned().collect()
    }

    /// Atomically replaces entry `seq` with a new `Pending` entry.
    ///
    /// Used when a sync run rebases a record: the replacement must not
    /// coexist with the entry it replaces, even across a crash.
    pub fn replace(
        &self,
        seq: SequenceNo,
        operation: Operation,
        snapshot: Record,
    ) -> CoreResult<SequenceNo> {
        let mut inner = self.inner.lock();
        match inner.entries.get(&seq) {
            Some(old) if old.record_id == snapshot.id => {}
            Some(old) => {
                return Err(CoreError::invalid_operation(format!(
                    "entry {seq} belongs to {}, not {}",
                    old.record_id, snapshot.id
                )));
            }
            None => return Err(CoreError::UnknownEntry(seq)),
        }

        let sequence = inner.next_sequence;
        let body = AppendBody {
            entry: ChangeLogEntry {
                sequence,
                record_id: snapshot.id.clone(),
                operation,
                snapshot,
                sync_state: SyncState::Pending,
            },
            supersedes: Some(seq),
        };
        inner.write(KIND_APPEND, &body, self.sync_on_write)?;

        inner.next_sequence = sequence.next();
        inner.entries.remove(&seq);
        inner.unsent.remove(&seq);
        inner.discarded.remove(&body.entry.record_id);
        inner.entries.insert(sequence, body.entry);
        Ok(sequence)
    }

    /// Takes up to `max` of the oldest `Pending` entries and marks them
    /// `InFlight`.
    ///
    /// A record that already has an entry in flight is skipped, so a record
    /// is never part of two pushes at once.
    pub fn peek_batch(&self, max: usize) -> Vec<ChangeLogEntry> {
        let mut inner = self.inner.lock();

        let selected: Vec<SequenceNo> = inner
            .entries
            .values()
            .filter(|e| e.is_pending() && !inner.in_flight_for(&e.record_id))
            .take(max)
            .map(|e| e.sequence)
            .collect();

        selected
            .into_iter()
            .filter_map(|seq| {
                inner.unsent.remove(&seq);
                let entry = inner.entries.get_mut(&seq)?;
                entry.sync_state = SyncState::InFlight;
                Some(entry.clone())
            })
            .collect()
    }

    /// Removes a confirmed entry.
    pub fn mark_synced(&self, seq: SequenceNo) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&seq) {
            return Err(CoreError::UnknownEntry(seq));
        }
        inner.write(KIND_REMOVE, &SequenceBody { sequence: seq }, self.sync_on_write)?;
        inner.entries.remove(&seq);
        inner.unsent.remove(&seq);
        Ok(())
    }

    /// Returns an `InFlight` entry to `Pending` so a later run retries it.
    ///
    /// If the record was written again while the entry was in flight, the
    /// entry is folded into that newer `Pending` entry instead.
    pub fn mark_failed(&self, seq: SequenceNo) -> CoreResult<()> {
        self.inner.lock().revert(seq, self.sync_on_write)
    }

    /// Reverts every `InFlight` entry. Returns how many were reverted.
    pub fn revert_in_flight(&self) -> CoreResult<usize> {
        let mut inner = self.inner.lock();
        let in_flight: Vec<SequenceNo> = inner
            .entries
            .values()
            .filter(|e| e.is_in_flight())
            .map(|e| e.sequence)
            .collect();
        for seq in &in_flight {
            inner.revert(*seq, self.sync_on_write)?;
        }
        Ok(in_flight.len())
    }

    /// Moves an entry out of the active log into the dead letters.
    pub fn dead_letter(
        &self,
        seq: SequenceNo,
        reason: impl Into<String>,
        at: Timestamp,
    ) -> CoreResult<DeadLetter> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&seq) {
            return Err(CoreError::UnknownEntry(seq));
        }

        let body = DeadLetterBody {
            sequence: seq,
            reason: reason.into(),
            at,
        };
        inner.write(KIND_DEAD_LETTER, &body, self.sync_on_write)?;

        let Some(mut entry) = inner.entries.remove(&seq) else {
            return Err(CoreError::UnknownEntry(seq));
        };
        entry.sync_state = SyncState::Failed;
        let letter = DeadLetter {
            entry,
            reason: body.reason,
            at,
        };
        inner.dead_letters.insert(seq, letter.clone());
        Ok(letter)
    }

    /// Returns the dead letters, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().dead_letters.values().cloned().collect()
    }

    /// Returns the dead letter with sequence `seq`.
    #[must_use]
    pub fn dead_letter_at(&self, seq: SequenceNo) -> Option<DeadLetter> {
        self.inner.lock().dead_letters.get(&seq).cloned()
    }

    /// Drops a dead letter for good.
    pub fn dismiss_dead_letter(&self, seq: SequenceNo) -> CoreResult<DeadLetter> {
        let mut inner = self.inner.lock();
        if !inner.dead_letters.contains_key(&seq) {
            return Err(CoreError::UnknownEntry(seq));
        }
        inner.write(KIND_DISMISS, &SequenceBody { sequence: seq }, self.sync_on_write)?;
        inner
            .dead_letters
            .remove(&seq)
            .ok_or(CoreError::UnknownEntry(seq))
    }

    /// Puts a dead letter back on the active log as a new `Pending` entry.
    ///
    /// If the record has been written since, the pending write already
    /// carries newer intent and the dead letter is only dismissed. Returns
    /// the sequence of the pending entry for the record.
    pub fn requeue_dead_letter(&self, seq: SequenceNo) -> CoreResult<SequenceNo> {
        let letter = self
            .dead_letter_at(seq)
            .ok_or(CoreError::UnknownEntry(seq))?;

        let requeued = match self.pending_for(&letter.entry.record_id) {
            Some(pending) => pending.sequence,
            None => {
                let seq = self.append(letter.entry.operation, letter.entry.snapshot)?;
                self.inner.lock().unsent.remove(&seq);
                seq
            }
        };
        self.dismiss_dead_letter(seq)?;
        Ok(requeued)
    }

    /// Returns true if `id` has a `Pending` entry newer than `seq`.
    #[must_use]
    pub fn has_newer_pending(&self, id: &RecordId, seq: SequenceNo) -> bool {
        self.inner
            .lock()
            .entries
            .range(seq.next()..)
            .any(|(_, e)| &e.record_id == id && e.is_pending())
    }

    /// Returns true if `id` has any entry in the active log.
    #[must_use]
    pub fn has_entry_for(&self, id: &RecordId) -> bool {
        self.inner
            .lock()
            .entries
            .values()
            .any(|e| &e.record_id == id)
    }

    /// Returns the `Pending` entry for `id`, if any.
    #[must_use]
    pub fn pending_for(&self, id: &RecordId) -> Option<ChangeLogEntry> {
        self.inner.lock().pending_for(id).cloned()
    }

    /// Returns the entry with sequence `seq`.
    #[must_use]
    pub fn get(&self, seq: SequenceNo) -> Option<ChangeLogEntry> {
        self.inner.lock().entries.get(&seq).cloned()
    }

    /// Returns a copy of the active log in sequence order.
    #[must_use]
    pub fn entries(&self) -> Vec<ChangeLogEntry> {
        self.inner.lock().entries.values().cloned().collect()
    }

    /// Returns true if no entry awaits confirmation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Returns the number of entries in the active log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns the number of `Pending` entries.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.is_pending())
            .count()
    }

    /// Returns the sequence number the next append will get.
    #[must_use]
    pub fn next_sequence(&self) -> SequenceNo {
        self.inner.lock().next_sequence
    }

    /// Returns the size of the log file in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.inner.lock().backend.size()?)
    }

    /// Discards the file contents once nothing in it is live.
    ///
    /// Does nothing, and returns false, while the active log or the dead
    /// letters hold anything, or when there is nothing to discard. The
    /// truncated file starts with a checkpoint so sequence numbers keep
    /// increasing.
    pub fn trim(&self) -> CoreResult<bool> {
        let mut inner = self.inner.lock();
        if !inner.entries.is_empty() || !inner.dead_letters.is_empty() || inner.frames == 0 {
            return Ok(false);
        }

        let body = CheckpointBody {
            next_sequence: inner.next_sequence,
        };
        let frame = encode_frame(LOG_MAGIC, KIND_CHECKPOINT, &body)?;
        let before = inner.backend.size()?;

        inner.backend.truncate(0)?;
        inner.backend.append(&frame)?;
        inner.backend.sync()?;
        inner.frames = 0;
        inner.discarded.clear();

        debug!(
            before,
            next_sequence = %body.next_sequence,
            "change log trimmed"
        );
        Ok(true)
    }
}

//! The local store: record table plus change log.
//!
//! Every application write is appended to the change log before the table
//! is updated. If the process dies between the two, opening the store
//! re-applies the logged snapshot, so the table never lags behind intent
//! that the log has already recorded.

use crate::change_log::ChangeLog;
use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::error::CoreResult;
use crate::record::{ChangeLogEntry, DeadLetter, Operation, Record};
use crate::table::{DurableTable, TableStats};
use crate::types::{Payload, RecordId, SequenceNo, Timestamp, Version};
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use tidesync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use tracing::{debug, info};

/// Local outcome decided for a change-log entry after talking to the remote.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// Replace the local record with this one and settle the entry. A
    /// tombstone removes the record.
    Store(Record),
    /// The remote confirmed a deletion; drop the tombstone and settle.
    Purge,
    /// Keep this local state and push it again in a later run.
    Requeue(Record),
}

/// What [`LocalStore::apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The record was written and the entry settled.
    Written,
    /// The tombstone was purged and the entry settled.
    Purged,
    /// The record was written and queued again under this sequence number.
    Requeued(SequenceNo),
    /// A newer local write exists; the result was discarded.
    Superseded,
}

/// Counters describing a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Record table counters.
    pub table: TableStats,
    /// Entries in the active change log.
    pub log_entries: usize,
    /// Entries waiting to be pushed.
    pub pending: usize,
    /// Entries the remote rejected.
    pub dead_letters: usize,
    /// Size of the change-log file in bytes.
    pub log_bytes: u64,
    /// Sequence number of the next change.
    pub next_sequence: SequenceNo,
}

/// Device-local record store with a change log of unsynced writes.
///
/// Reads and writes never touch the network. Writes and the application of
/// sync results are serialized by a write gate, which is what makes the
/// "newer local write wins" check in [`apply`](Self::apply) race-free.
pub struct LocalStore {
    table: DurableTable,
    log: ChangeLog,
    write_gate: Mutex<()>,
    dir: Option<StoreDir>,
    in_memory: bool,
    compact_min_bytes: u64,
}

impl LocalStore {
    /// Opens the store in directory `path`.
    ///
    /// # Errors
    ///
    /// Fails if the directory is locked by another process, is missing and
    /// `create_if_missing` is off, or either file is corrupt.
    pub fn open(path: &Path, config: &StoreConfig) -> CoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let table = FileBackend::open(&dir.table_path())?;
        let log = FileBackend::open(&dir.log_path())?;

        info!(path = %path.display(), "opening local store");
        Self::assemble(Box::new(table), Box::new(log), config, Some(dir), false)
    }

    /// Opens a store over the given table and change-log backends.
    ///
    /// The record table of such a store is never compacted, since there is
    /// no durable place to rewrite it to.
    pub fn with_backends(
        table: Box<dyn StorageBackend>,
        log: Box<dyn StorageBackend>,
        config: &StoreConfig,
    ) -> CoreResult<Self> {
        Self::assemble(table, log, config, None, false)
    }

    /// Creates an empty store that lives in memory.
    pub fn in_memory() -> CoreResult<Self> {
        Self::assemble(
            Box::new(InMemoryBackend::new()),
            Box::new(InMemoryBackend::new()),
            &StoreConfig::default(),
            None,
            true,
        )
    }

    fn assemble(
        table: Box<dyn StorageBackend>,
        log: Box<dyn StorageBackend>,
        config: &StoreConfig,
        dir: Option<StoreDir>,
        in_memory: bool,
    ) -> CoreResult<Self> {
        let store = Self {
            table: DurableTable::open(table, config.sync_on_write)?,
            log: ChangeLog::open(log, config.sync_on_write)?,
            write_gate: Mutex::new(()),
            dir,
            in_memory,
            compact_min_bytes: config.compact_min_bytes,
        };
        store.recover()?;
        if config.trim_on_open {
            store.trim()?;
        }
        Ok(store)
    }

    fn recover(&self) -> CoreResult<usize> {
        let mut repaired = 0;
        for entry in self.log.entries() {
            let stale = match self.table.version_of(&entry.record_id) {
                None => true,
                Some(version) => version < entry.snapshot.version,
            };
            if stale {
                self.table.put(&entry.snapshot)?;
                repaired += 1;
            }
        }
        repaired += self.purge_discarded()?;
        if repaired > 0 {
            info!(repaired, "re-applied logged writes missing from the table");
        }
        Ok(repaired)
    }

    /// Removes records whose unsent create the change log discarded.
    fn purge_discarded(&self) -> CoreResult<usize> {
        let mut purged = 0;
        for id in self.log.discarded() {
            if self.log.has_entry_for(&id) {
                continue;
            }
            let Some(record) = self.table.get(&id)? else {
                continue;
            };
            if !record.deleted {
                self.table.put(&record.tombstone(record.updated_at))?;
            }
            self.table.purge(&id)?;
            purged += 1;
        }
        Ok(purged)
    }

    /// Returns the live record for `id`. Tombstones read as absent.
    pub fn get(&self, id: &RecordId) -> CoreResult<Option<Record>> {
        Ok(self.table.get(id)?.filter(|r| !r.deleted))
    }

    /// Returns every live record in ID order.
    pub fn records(&self) -> CoreResult<Vec<Record>> {
        self.table
            .scan()
            .filter(|r| !matches!(r, Ok(record) if record.deleted))
            .collect()
    }

    /// Writes `payload` under `id` at the current time.
    pub fn write(&self, id: impl Into<RecordId>, payload: Payload) -> CoreResult<Record> {
        self.write_at(id, payload, Timestamp::now())
    }

    /// Writes `payload` under `id` with an explicit timestamp.
    ///
    /// The version is one past the stored version. The change is logged
    /// first, then the table is updated.
    pub fn write_at(
        &self,
        id: impl Into<RecordId>,
        payload: Payload,
        at: Timestamp,
    ) -> CoreResult<Record> {
        let id = id.into();
        let _gate = self.write_gate.lock();

        let previous = self.table.get(&id)?;
        let version = previous
            .as_ref()
            .map_or(Version::INITIAL, |p| p.version.next());
        let record = Record::new(id, version, payload, at);
        let operation = Operation::for_write(previous.as_ref(), &record);

        let sequence = self.log.append(operation, record.clone())?;
        self.table.put(&record)?;

        debug!(id = %record.id, version = %record.version, %operation, %sequence, "local write");
        Ok(record)
    }

    /// Deletes `id` at the current time.
    pub fn remove(&self, id: &RecordId) -> CoreResult<Option<Record>> {
        self.remove_at(id, Timestamp::now())
    }

    /// Tombstones `id` with an explicit timestamp.
    ///
    /// Returns the tombstone, or `None` if there is no such record. Removing
    /// a tombstone changes nothing.
    ///
    /// A record created locally and not yet offered to the remote is purged
    /// outright, together with its pending create; nothing is pushed for it.
    pub fn remove_at(&self, id: &RecordId, at: Timestamp) -> CoreResult<Option<Record>> {
        let _gate = self.write_gate.lock();

        let Some(current) = self.table.get(id)? else {
            return Ok(None);
        };
        if current.deleted {
            return Ok(Some(current));
        }

        let tombstone = current.tombstone(at);
        if let Some(sequence) = self.log.discard_unsent_create(id)? {
            self.table.put(&tombstone)?;
            self.table.purge(id)?;
            debug!(%id, %sequence, "local delete of unsent create");
            return Ok(Some(tombstone));
        }
        let sequence = self.log.append(Operation::Delete, tombstone.clone())?;
        self.table.put(&tombstone)?;

        debug!(%id, version = %tombstone.version, %sequence, "local delete");
        Ok(Some(tombstone))
    }

    /// Applies a sync result for `entry`.
    ///
    /// If the record was written locally after `entry` was taken, the result
    /// is discarded and the entry settled: the newer write is pushed on its
    /// own. Applying the same result twice leaves the same state.
    pub fn apply(&self, entry: &ChangeLogEntry, reconciled: Reconciled) -> CoreResult<Applied> {
        let _gate = self.write_gate.lock();
        let seq = entry.sequence;
        let known = self.log.get(seq).is_some();

        if self.log.has_newer_pending(&entry.record_id, seq) {
            if known {
                self.log.mark_synced(seq)?;
            }
            debug!(id = %entry.record_id, %seq, "sync result superseded by newer local write");
            return Ok(Applied::Superseded);
        }

        let applied = match reconciled {
            Reconciled::Store(record) => {
                self.table.put(&record)?;
                let applied = if record.deleted {
                    self.table.purge(&record.id)?;
                    Applied::Purged
                } else {
                    Applied::Written
                };
                if known {
                    self.log.mark_synced(seq)?;
                }
                applied
            }
            Reconciled::Purge => {
                self.table.purge(&entry.record_id)?;
                if known {
                    self.log.mark_synced(seq)?;
                }
                Applied::Purged
            }
            Reconciled::Requeue(record) => {
                let operation = if record.deleted {
                    Operation::Delete
                } else {
                    Operation::Update
                };
                let requeued = if known {
                    self.log.replace(seq, operation, record.clone())?
                } else {
                    self.log.append(operation, record.clone())?
                };
                self.table.put(&record)?;
                Applied::Requeued(requeued)
            }
        };

        debug!(id = %entry.record_id, %seq, ?applied, "applied sync result");
        Ok(applied)
    }

    /// Stores a record pulled from the remote.
    ///
    /// Skipped, returning false, while the record has unsynced local changes
    /// or when the local copy is at least as new. A remote tombstone removes
    /// the record.
    pub fn hydrate_record(&self, record: &Record) -> CoreResult<bool> {
        let _gate = self.write_gate.lock();

        if self.log.has_entry_for(&record.id) {
            return Ok(false);
        }
        let local = self.table.version_of(&record.id);
        if local.is_some_and(|v| v >= record.version) {
            return Ok(false);
        }

        if record.deleted {
            if local.is_none() {
                return Ok(false);
            }
            self.table.put(record)?;
            self.table.purge(&record.id)?;
        } else {
            self.table.put(record)?;
        }
        Ok(true)
    }

    /// Moves an entry the remote refused into the dead letters.
    pub fn dead_letter(
        &self,
        seq: SequenceNo,
        reason: impl Into<String>,
        at: Timestamp,
    ) -> CoreResult<DeadLetter> {
        let _gate = self.write_gate.lock();
        self.log.dead_letter(seq, reason, at)
    }

    /// Returns the dead letters, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.log.dead_letters()
    }

    /// Drops a dead letter.
    pub fn dismiss_dead_letter(&self, seq: SequenceNo) -> CoreResult<DeadLetter> {
        let _gate = self.write_gate.lock();
        self.log.dismiss_dead_letter(seq)
    }

    /// Queues a dead letter for another push.
    pub fn requeue_dead_letter(&self, seq: SequenceNo) -> CoreResult<SequenceNo> {
        let _gate = self.write_gate.lock();
        self.log.requeue_dead_letter(seq)
    }

    /// Reclaims dead space in both files.
    ///
    /// The change log is emptied once nothing in it is live. The record
    /// table is rewritten once it reaches `compact_min_bytes` and at least
    /// half of it is dead frames. Returns true if either happened.
    pub fn trim(&self) -> CoreResult<bool> {
        let _gate = self.write_gate.lock();
        self.purge_discarded()?;
        let trimmed = self.log.trim()?;
        let compacted = self.table.needs_compaction(self.compact_min_bytes) && self.compact_table()?;
        Ok(trimmed || compacted)
    }

    fn compact_table(&self) -> CoreResult<bool> {
        let compaction = match &self.dir {
            Some(dir) => {
                let target = dir.compact_path();
                if target.exists() {
                    fs::remove_file(&target)?;
                }
                let fresh = FileBackend::open(&target)?;
                let table_path = dir.table_path();
                self.table.compact(Box::new(fresh), || {
                    fs::rename(&target, &table_path)?;
                    Ok(())
                })?
            }
            None if self.in_memory => self
                .table
                .compact(Box::new(InMemoryBackend::new()), || Ok(()))?,
            None => return Ok(false),
        };

        info!(
            records = compaction.records,
            before = compaction.bytes_before,
            after = compaction.bytes_after,
            "compacted record table"
        );
        Ok(true)
    }

    /// Returns counters for this store.
    pub fn stats(&self) -> CoreResult<StoreStats> {
        Ok(StoreStats {
            table: self.table.stats()?,
            log_entries: self.log.len(),
            pending: self.log.pending_count(),
            dead_letters: self.log.dead_letters().len(),
            log_bytes: self.log.size()?,
            next_sequence: self.log.next_sequence(),
        })
    }

    /// Returns the store directory, if the store is file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(StoreDir::path)
    }

    /// Returns the record table.
    #[must_use]
    pub fn table(&self) -> &DurableTable {
        &self.table
    }

    /// Returns the change log.
    #[must_use]
    pub fn log(&self) -> &ChangeLog {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_storage::InMemoryBackend;

    fn text(s: &str) -> Payload {
        Payload::Text(s.into())
    }

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn write_logs_then_stores() {
        let store = LocalStore::in_memory().unwrap();
        let record = store.write_at("n1", text("A"), ts(10)).unwrap();

        assert_eq!(record.version, Version::INITIAL);
        assert_eq!(store.get(&"n1".into()).unwrap(), Some(record.clone()));

        let entries = store.log().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, Operation::Create);
        assert_eq!(entries[0].snapshot, record);
    }

    #[test]
    fn rewrites_bump_version_and_coalesce() {
        let store = LocalStore::in_memory().unwrap();
        store.write_at("n1", text("A"), ts(10)).unwrap();
        let second = store.write_at("n1", text("B"), ts(20)).unwrap();

        assert_eq!(second.version, Version::new(2));
        let entries = store.log().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, Operation::Create);
        assert_eq!(entries[0].snapshot.payload, text("B"));
    }

    #[test]
    fn remove_tombstones() {
        let store = LocalStore::in_memory().unwrap();
        store.write_at("n1", text("A"), ts(10)).unwrap();
        let offered = store.log().peek_batch(1).remove(0);
        store.log().mark_failed(offered.sequence).unwrap();

        let tomb = store.remove_at(&"n1".into(), ts(20)).unwrap().unwrap();
        assert!(tomb.deleted);
        assert_eq!(store.get(&"n1".into()).unwrap(), None);
        assert!(store.table().contains(&"n1".into()));
        assert_eq!(store.log().entries()[0].operation, Operation::Delete);

        assert_eq!(store.remove(&"ghost".into()).unwrap(), None);
        assert_eq!(store.remove(&"n1".into()).unwrap(), Some(tomb));
        assert_eq!(store.log().len(), 1);
    }

    #[test]
    fn apply_store_settles_entry() {
        let store = LocalStore::in_memory().unwrap();
        store.write_at("n1", text("A"), ts(10)).unwrap();
        let entry = store.log().peek_batch(1).remove(0);

        let server = Record::new("n1", Version::new(1), text("A"), ts(10));
        let applied = store
            .apply(&entry, Reconciled::Store(server.clone()))
            .unwrap();
        assert_eq!(applied, Applied::Written);
        assert!(store.log().is_empty());

        // Idempotent.
        let again = store.apply(&entry, Reconciled::Store(server.clone())).unwrap();
        assert_eq!(again, Applied::Written);
        assert_eq!(store.get(&"n1".into()).unwrap(), Some(server));
        assert!(store.log().is_empty());
    }

    #[test]
    fn apply_skips_when_newer_write_pending() {
        let store = LocalStore::in_memory().unwrap();
        store.write_at("n1", text("A"), ts(10)).unwrap();
        let entry = store.log().peek_batch(1).remove(0);
        let newer = store.write_at("n1", text("B"), ts(20)).unwrap();

        let server = Record::new("n1", Version::new(1), text("A"), ts(10));
        let applied = store.apply(&entry, Reconciled::Store(server)).unwrap();

        assert_eq!(applied, Applied::Superseded);
        assert_eq!(store.get(&"n1".into()).unwrap(), Some(newer));
        assert_eq!(store.log().len(), 1);
        assert!(store.log().get(entry.sequence).is_none());
    }

    #[test]
    fn removing_an_unsent_create_leaves_nothing_to_push() {
        let table = InMemoryBackend::new();
        let log = InMemoryBackend::new();
        let config = StoreConfig::default();
        let store =
            LocalStore::with_backends(Box::new(table.clone()), Box::new(log.clone()), &config)
                .unwrap();

        store.write_at("n1", text("A"), ts(10)).unwrap();
        store.write_at("n1", text("B"), ts(11)).unwrap();
        let tomb = store.remove_at(&"n1".into(), ts(20)).unwrap().unwrap();
        assert!(tomb.deleted);
        assert!(!store.table().contains(&"n1".into()));
        assert!(store.log().is_empty());
        drop(store);

        let reopened =
            LocalStore::with_backends(Box::new(table), Box::new(log), &config).unwrap();
        assert!(!reopened.table().contains(&"n1".into()));
        assert!(reopened.log().is_empty());
    }

    #[test]
    fn recovery_purges_a_discarded_create() {
        let table = InMemoryBackend::new();
        let log = InMemoryBackend::new();
        let config = StoreConfig::default().trim_on_open(false);
        {
            let store =
                LocalStore::with_backends(Box::new(table.clone()), Box::new(log.clone()), &config)
                    .unwrap();
            store.write_at("n1", text("A"), ts(10)).unwrap();
            // Crash after the discard is logged but before the table purge.
            store.log().discard_unsent_create(&"n1".into()).unwrap().unwrap();
            assert!(store.table().contains(&"n1".into()));
        }

        let store = LocalStore::with_backends(Box::new(table), Box::new(log), &config).unwrap();
        assert!(!store.table().contains(&"n1".into()));
        assert!(store.log().is_empty());
    }

    #[test]
    fn recreated_record_survives_discard_replay() {
        let table = InMemoryBackend::new();
        let log = InMemoryBackend::new();
        let config = StoreConfig::default().trim_on_open(false);
        {
            let store =
                LocalStore::with_backends(Box::new(table.clone()), Box::new(log.clone()), &config)
                    .unwrap();
            store.write_at("n1", text("A"), ts(10)).unwrap();
            store.remove_at(&"n1".into(), ts(11)).unwrap();
            store.write_at("n1", text("again"), ts(12)).unwrap();
            let entry = store.log().peek_batch(1).remove(0);
            store.apply(&entry, Reconciled::Store(entry.snapshot.clone())).unwrap();
        }

        let store = LocalStore::with_backends(Box::new(table), Box::new(log), &config).unwrap();
        assert_eq!(store.get(&"n1".into()).unwrap().unwrap().payload, text("again"));
    }

    #[test]
    fn apply_purge_drops_tombstone() {
        let store = LocalStore::in_memory().unwrap();
        store.write_at("n1", text("A"), ts(10)).unwrap();
        let first = store.log().peek_batch(1).remove(0);
        store.apply(&first, Reconciled::Store(first.snapshot.clone())).unwrap();

        store.remove_at(&"n1".into(), ts(20)).unwrap();
        let entry = store.log().peek_batch(1).remove(0);
        assert_eq!(
            store.apply(&entry, Reconciled::Purge).unwrap(),
            Applied::Purged
        );
        assert!(!store.table().contains(&"n1".into()));
        assert!(store.log().is_empty());
    }

    #[test]
    fn apply_remote_tombstone_purges() {
        let store = LocalStore::in_memory().unwrap();
        store.write_at("n1", text("A"), ts(10)).unwrap();
        let entry = store.log().peek_batch(1).remove(0);

        let server = Record::new("n1", Version::new(4), text("A"), ts(50)).tombstone(ts(60));
        assert_eq!(
            store.apply(&entry, Reconciled::Store(server)).unwrap(),
            Applied::Purged
        );
        assert!(!store.table().contains(&"n1".into()));
        assert!(store.log().is_empty());
    }

    #[test]
    fn apply_requeue_replaces_entry() {
        let store = LocalStore::in_memory().unwrap();
        store.write_at("n1", text("mine"), ts(30)).unwrap();
        let entry = store.log().peek_batch(1).remove(0);

        let rebased = Record::new("n1", Version::new(6), text("mine"), ts(30));
        let applied = store
            .apply(&entry, Reconciled::Requeue(rebased.clone()))
            .unwrap();

        let Applied::Requeued(seq) = applied else {
            panic!("expected requeue, got {applied:?}");
        };
        assert_eq!(store.log().len(), 1);
        let requeued = store.log().get(seq).unwrap();
        assert!(requeued.is_pending());
        assert_eq!(requeued.operation, Operation::Update);
        assert_eq!(store.get(&"n1".into()).unwrap(), Some(rebased));
    }

    #[test]
    fn recovery_reapplies_logged_write() {
        let table = InMemoryBackend::new();
        let log = InMemoryBackend::new();
        let config = StoreConfig::default();

        {
            let store =
                LocalStore::with_backends(Box::new(table.clone()), Box::new(log.clone()), &config)
                    .unwrap();
            store.write_at("n1", text("A"), ts(10)).unwrap();
        }
        // Simulate a crash after the log append but before the table put.
        let lost = LocalStore::with_backends(
            Box::new(InMemoryBackend::new()),
            Box::new(log.clone()),
            &config,
        )
        .unwrap();

        let record = lost.get(&"n1".into()).unwrap().unwrap();
        assert_eq!(record.payload, text("A"));
        assert_eq!(lost.log().pending_count(), 1);
    }

    #[test]
    fn hydrate_respects_local_intent() {
        let store = LocalStore::in_memory().unwrap();
        store.write_at("mine", text("local"), ts(10)).unwrap();

        let remote_mine = Record::new("mine", Version::new(9), text("remote"), ts(5));
        assert!(!store.hydrate_record(&remote_mine).unwrap());
        assert_eq!(store.get(&"mine".into()).unwrap().unwrap().payload, text("local"));

        let theirs = Record::new("theirs", Version::new(3), text("remote"), ts(5));
        assert!(store.hydrate_record(&theirs).unwrap());
        assert!(!store.hydrate_record(&theirs).unwrap());

        let gone = theirs.tombstone(ts(6));
        assert!(store.hydrate_record(&gone).unwrap());
        assert!(!store.table().contains(&"theirs".into()));
    }

    #[test]
    fn trim_compacts_file_table_and_survives_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let config = StoreConfig::default().compact_min_bytes(1024);
        {
            let store = LocalStore::open(temp.path(), &config).unwrap();
            for i in 0..50 {
                store.write_at("n1", text(&format!("v{i}")), ts(i)).unwrap();
            }
            store.write_at("n2", text("B"), ts(100)).unwrap();
            for entry in store.log().peek_batch(10) {
                let server = entry.snapshot.clone();
                store.apply(&entry, Reconciled::Store(server)).unwrap();
            }

            let before = store.stats().unwrap().table;
            assert!(store.trim().unwrap());
            let after = store.stats().unwrap().table;
            assert!(after.bytes < before.bytes / 10);
            assert_eq!(after.dead_bytes, 0);
            assert_eq!(after.live, 2);

            store.write_at("n3", text("C"), ts(200)).unwrap();
        }

        let store = LocalStore::open(temp.path(), &config).unwrap();
        assert_eq!(store.get(&"n1".into()).unwrap().unwrap().payload, text("v49"));
        assert_eq!(store.get(&"n3".into()).unwrap().unwrap().payload, text("C"));
        assert_eq!(store.log().pending_count(), 1);
        assert!(!temp.path().join("records.dat.compact").exists());
    }

    #[test]
    fn backend_stores_are_not_compacted() {
        let config = StoreConfig::default().compact_min_bytes(0);
        let store = LocalStore::with_backends(
            Box::new(InMemoryBackend::new()),
            Box::new(InMemoryBackend::new()),
            &config,
        )
        .unwrap();
        store.write_at("n1", text("A"), ts(1)).unwrap();
        store.write_at("n1", text("B"), ts(2)).unwrap();

        let before = store.stats().unwrap().table;
        store.trim().unwrap();
        assert_eq!(store.stats().unwrap().table.bytes, before.bytes);
        assert!(before.dead_bytes > 0);
    }

    #[test]
    fn stats_reports_counts() {
        let store = LocalStore::in_memory().unwrap();
        store.write_at("a", text("A"), ts(1)).unwrap();
        store.write_at("b", text("B"), ts(2)).unwrap();
        store.remove_at(&"b".into(), ts(3)).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.table.live, 1);
        assert_eq!(stats.table.tombstones, 1);
        assert_eq!(stats.log_entries, 2);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.dead_letters, 0);
    }
}

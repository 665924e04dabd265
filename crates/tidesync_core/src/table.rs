//! Durable local record table.
//!
//! The table is an append-only frame log on a [`StorageBackend`] plus an
//! in-memory index from record ID to the offset of its latest frame. Opening
//! a table replays the log to rebuild the index; lookups read and decode the
//! frame the index points at.
//!
//! Rewrites and purges leave dead frames behind. [`DurableTable::compact`]
//! copies the frame of every current record into a fresh backend and swaps
//! it in; records and tombstones are carried over unchanged.

use crate::error::{CoreError, CoreResult};
use crate::frame::{encode_frame, read_frame_at, FrameReader};
use crate::record::Record;
use crate::types::{RecordId, Timestamp, Version};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tidesync_storage::StorageBackend;
use tracing::{debug, warn};

/// Magic bytes of record-table frames.
pub const TABLE_MAGIC: [u8; 4] = *b"TSRT";

const KIND_PUT: u8 = 1;
const KIND_PURGE: u8 = 2;

#[derive(Serialize, Deserialize)]
struct PurgeBody {
    id: RecordId,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u64,
    len: u64,
    version: Version,
    deleted: bool,
}

struct TableInner {
    backend: Box<dyn StorageBackend>,
    index: BTreeMap<RecordId, Slot>,
    /// Bytes of the frames the index points at.
    live_bytes: u64,
}

impl TableInner {
    fn insert(&mut self, id: RecordId, slot: Slot) {
        self.live_bytes += slot.len;
        if let Some(old) = self.index.insert(id, slot) {
            self.live_bytes -= old.len;
        }
    }

    fn remove(&mut self, id: &RecordId) {
        if let Some(old) = self.index.remove(id) {
            self.live_bytes -= old.len;
        }
    }
}

/// Counters describing a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Records that are not tombstoned.
    pub live: usize,
    /// Tombstones awaiting remote confirmation.
    pub tombstones: usize,
    /// Size of the backing log in bytes.
    pub bytes: u64,
    /// Bytes held by superseded or purged frames.
    pub dead_bytes: u64,
}

/// Result of [`DurableTable::compact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compaction {
    /// Records and tombstones carried over.
    pub records: usize,
    /// Size before compaction.
    pub bytes_before: u64,
    /// Size after compaction.
    pub bytes_after: u64,
}

/// Crash-durable key-value table of application records.
///
/// Exactly one current [`Record`] exists per ID. Deleting writes a tombstone;
/// only [`purge`](Self::purge) removes a record physically, after the remote
/// confirmed the deletion.
///
/// All operations are local and synchronous. Any failure of the medium is a
/// [`CoreError`] with [`is_storage_failure`](CoreError::is_storage_failure)
/// set and is returned to the caller as-is.
pub struct DurableTable {
    inner: Mutex<TableInner>,
    sync_on_write: bool,
}

impl DurableTable {
    /// Opens a table over `backend`, replaying its frames.
    ///
    /// A torn final frame is truncated away.
    ///
    /// # Errors
    ///
    /// Fails if a complete frame is corrupt or the backend fails.
    pub fn open(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> CoreResult<Self> {
        let mut inner = TableInner {
            backend,
            index: BTreeMap::new(),
            live_bytes: 0,
        };
        let mut frames = Vec::new();
        let (valid_end, size) = {
            let mut reader = FrameReader::new(inner.backend.as_ref(), TABLE_MAGIC)?;
            for frame in reader.by_ref() {
                frames.push(frame?);
            }
            (reader.valid_end(), reader.size())
        };

        for frame in &frames {
            match frame.kind {
                KIND_PUT => {
                    let record: Record = frame.decode()?;
                    let slot = Slot {
                        offset: frame.offset,
                        len: frame.encoded_len(),
                        version: record.version,
                        deleted: record.deleted,
                    };
                    inner.insert(record.id, slot);
                }
                KIND_PURGE => {
                    let body: PurgeBody = frame.decode()?;
                    inner.remove(&body.id);
                }
                other => {
                    return Err(CoreError::corrupted(format!(
                        "unknown table frame kind {other} at offset {}",
                        frame.offset
                    )));
                }
            }
        }

        if valid_end < size {
            warn!(valid_end, size, "truncating torn tail of record table");
            inner.backend.truncate(valid_end)?;
        }

        debug!(
            records = inner.index.len(),
            bytes = valid_end,
            live_bytes = inner.live_bytes,
            "record table opened"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            sync_on_write,
        })
    }

    /// Returns the current record for `id`, tombstones included.
    pub fn get(&self, id: &RecordId) -> CoreResult<Option<Record>> {
        let inner = self.inner.lock();
        let Some(slot) = inner.index.get(id) else {
            return Ok(None);
        };

        let frame = read_frame_at(inner.backend.as_ref(), TABLE_MAGIC, slot.offset)?;
        if frame.kind != KIND_PUT {
            return Err(CoreError::corrupted(format!(
                "index for {id} points at a non-record frame"
            )));
        }

        let record: Record = frame.decode()?;
        if &record.id != id {
            return Err(CoreError::corrupted(format!(
                "index for {id} points at record {}",
                record.id
            )));
        }
        Ok(Some(record))
    }

    /// Returns the version of the current record without decoding it.
    #[must_use]
    pub fn version_of(&self, id: &RecordId) -> Option<Version> {
        self.inner.lock().index.get(id).map(|slot| slot.version)
    }

    /// Returns true if a record (or tombstone) exists for `id`.
    #[must_use]
    pub fn contains(&self, id: &RecordId) -> bool {
        self.inner.lock().index.contains_key(id)
    }

    /// Upserts `record`, replacing whatever is stored under its ID.
    ///
    /// Writing the same record twice leaves the same state.
    pub fn put(&self, record: &Record) -> CoreResult<()> {
        let frame = encode_frame(TABLE_MAGIC, KIND_PUT, record)?;

        let mut inner = self.inner.lock();
        let offset = inner.backend.append(&frame)?;
        if self.sync_on_write {
            inner.backend.sync()?;
        }
        inner.insert(
            record.id.clone(),
            Slot {
                offset,
                len: frame.len() as u64,
                version: record.version,
                deleted: record.deleted,
            },
        );
        Ok(())
    }

    /// Tombstones the record now. See [`delete_at`](Self::delete_at).
    pub fn delete(&self, id: &RecordId) -> CoreResult<Option<Record>> {
        self.delete_at(id, Timestamp::now())
    }

    /// Tombstones the record at `at`.
    ///
    /// Returns the tombstone, or `None` if there is no such record. Deleting
    /// a tombstone returns it unchanged.
    pub fn delete_at(&self, id: &RecordId, at: Timestamp) -> CoreResult<Option<Record>> {
        match self.get(id)? {
            None => Ok(None),
            Some(record) if record.deleted => Ok(Some(record)),
            Some(record) => {
                let tombstone = record.tombstone(at);
                self.put(&tombstone)?;
                Ok(Some(tombstone))
            }
        }
    }

    /// Physically removes a tombstone.
    ///
    /// Returns false, and leaves the table alone, when the record is missing
    /// or still live.
    pub fn purge(&self, id: &RecordId) -> CoreResult<bool> {
        let mut inner = self.inner.lock();
        match inner.index.get(id) {
            Some(slot) if slot.deleted => {}
            _ => return Ok(false),
        }

        let frame = encode_frame(TABLE_MAGIC, KIND_PURGE, &PurgeBody { id: id.clone() })?;
        inner.backend.append(&frame)?;
        if self.sync_on_write {
            inner.backend.sync()?;
        }
        inner.remove(id);
        Ok(true)
    }

    /// Returns true once the table is at least `min_bytes` long and at
    /// least half of it is dead frames.
    #[must_use]
    pub fn needs_compaction(&self, min_bytes: u64) -> bool {
        let inner = self.inner.lock();
        let Ok(size) = inner.backend.size() else {
            return false;
        };
        let dead = size.saturating_sub(inner.live_bytes);
        dead > 0 && size >= min_bytes && dead * 2 >= size
    }

    /// Rewrites the current records into `fresh` and switches to it.
    ///
    /// `fresh` must be empty. Once it holds every current frame and is
    /// synced, `commit` runs; it is where a caller makes the new backend
    /// the durable one (for example by renaming its file over the old
    /// one). If `commit` fails the table keeps using the old backend.
    /// Writers are blocked for the whole rewrite.
    ///
    /// # Errors
    ///
    /// Fails if either backend or `commit` fails. The table is unchanged
    /// in that case.
    pub fn compact(
        &self,
        mut fresh: Box<dyn StorageBackend>,
        commit: impl FnOnce() -> CoreResult<()>,
    ) -> CoreResult<Compaction> {
        let mut inner = self.inner.lock();
        if fresh.size()? != 0 {
            return Err(CoreError::invalid_operation(
                "compaction target is not empty",
            ));
        }

        let bytes_before = inner.backend.size()?;
        let mut moved = Vec::with_capacity(inner.index.len());
        for (id, slot) in &inner.index {
            let frame = inner.backend.read_at(slot.offset, slot.len as usize)?;
            let offset = fresh.append(&frame)?;
            moved.push((id.clone(), offset));
        }
        fresh.sync()?;
        commit()?;

        inner.backend = fresh;
        for (id, offset) in moved {
            if let Some(slot) = inner.index.get_mut(&id) {
                slot.offset = offset;
            }
        }
        let bytes_after = inner.backend.size()?;

        let compaction = Compaction {
            records: inner.index.len(),
            bytes_before,
            bytes_after,
        };
        debug!(
            records = compaction.records,
            bytes_before, bytes_after, "record table compacted"
        );
        Ok(compaction)
    }

    /// Returns a lazy scan over the current records, in ID order.
    ///
    /// The set of IDs is fixed when the scan starts; records are read as the
    /// scan reaches them, so a record purged mid-scan is skipped and a
    /// record rewritten mid-scan is seen in its newer state.
    #[must_use]
    pub fn scan(&self) -> TableScan<'_> {
        let ids = self.inner.lock().index.keys().cloned().collect();
        TableScan {
            table: self,
            ids,
            position: 0,
        }
    }

    /// Returns the number of records, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Returns true if the table holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }

    /// Returns counters for this table.
    pub fn stats(&self) -> CoreResult<TableStats> {
        let inner = self.inner.lock();
        let tombstones = inner.index.values().filter(|slot| slot.deleted).count();
        let bytes = inner.backend.size()?;
        Ok(TableStats {
            live: inner.index.len() - tombstones,
            tombstones,
            bytes,
            dead_bytes: bytes.saturating_sub(inner.live_bytes),
        })
    }

    /// Forces appended frames to the medium.
    pub fn sync(&self) -> CoreResult<()> {
        self.inner.lock().backend.sync()?;
        Ok(())
    }
}

/// Lazy, restartable iterator returned by [`DurableTable::scan`].
pub struct TableScan<'a> {
    table: &'a DurableTable,
    ids: Vec<RecordId>,
    position: usize,
}

impl TableScan<'_> {
    /// Rewinds to the first record of the same ID snapshot.
    pub fn restart(&mut self) {
        self.position = 0;
    }
}

impl Iterator for TableScan<'_> {
    type Item = CoreResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.ids.get(self.position) {
            self.position += 1;
            match self.table.get(id) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.ids.len() - self.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;
    use tidesync_storage::{FaultyBackend, InMemoryBackend};

    fn record(id: &str, version: u64, text: &str) -> Record {
        Record::new(
            id,
            Version::new(version),
            Payload::Text(text.into()),
            Timestamp::from_millis(100 * version),
        )
    }

    fn open(backend: &InMemoryBackend) -> DurableTable {
        DurableTable::open(Box::new(backend.clone()), false).unwrap()
    }

    #[test]
    fn put_and_get() {
        let table = open(&InMemoryBackend::new());
        let r = record("n1", 1, "A");

        table.put(&r).unwrap();

        assert_eq!(table.get(&"n1".into()).unwrap(), Some(r));
        assert_eq!(table.get(&"missing".into()).unwrap(), None);
        assert_eq!(table.version_of(&"n1".into()), Some(Version::new(1)));
    }

    #[test]
    fn put_overwrites_and_is_idempotent() {
        let table = open(&InMemoryBackend::new());
        table.put(&record("n1", 1, "A")).unwrap();

        let newer = record("n1", 2, "B");
        table.put(&newer).unwrap();
        table.put(&newer).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&"n1".into()).unwrap(), Some(newer));
    }

    #[test]
    fn delete_writes_tombstone() {
        let table = open(&InMemoryBackend::new());
        table.put(&record("n1", 1, "A")).unwrap();

        let tomb = table
            .delete_at(&"n1".into(), Timestamp::from_millis(500))
            .unwrap()
            .unwrap();
        assert!(tomb.deleted);
        assert_eq!(tomb.version, Version::new(2));

        let again = table.delete(&"n1".into()).unwrap().unwrap();
        assert_eq!(again, tomb);
        assert!(table.contains(&"n1".into()));
        assert_eq!(table.delete(&"nope".into()).unwrap(), None);
    }

    #[test]
    fn purge_only_removes_tombstones() {
        let table = open(&InMemoryBackend::new());
        table.put(&record("live", 1, "A")).unwrap();
        table.put(&record("dead", 1, "B")).unwrap();
        table.delete(&"dead".into()).unwrap();

        assert!(!table.purge(&"live".into()).unwrap());
        assert!(table.purge(&"dead".into()).unwrap());
        assert!(!table.purge(&"dead".into()).unwrap());

        assert!(table.contains(&"live".into()));
        assert!(!table.contains(&"dead".into()));
    }

    #[test]
    fn reopen_replays_log() {
        let backend = InMemoryBackend::new();
        {
            let table = open(&backend);
            table.put(&record("a", 1, "A")).unwrap();
            table.put(&record("b", 1, "B")).unwrap();
            table.put(&record("a", 2, "A2")).unwrap();
            table.delete(&"b".into()).unwrap();
            table.purge(&"b".into()).unwrap();
        }

        let table = open(&backend);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&"a".into()).unwrap(), Some(record("a", 2, "A2")));
    }

    #[test]
    fn torn_tail_is_truncated() {
        let backend = InMemoryBackend::new();
        {
            let table = open(&backend);
            table.put(&record("a", 1, "A")).unwrap();
        }
        let intact = backend.data().len();
        let mut writer = backend.clone();
        writer.append(&[b'T', b'S', b'R', b'T', 1, 0]).unwrap();

        let table = open(&backend);
        assert_eq!(backend.data().len(), intact);
        assert_eq!(table.len(), 1);

        table.put(&record("b", 1, "B")).unwrap();
        drop(table);
        assert_eq!(open(&backend).len(), 2);
    }

    #[test]
    fn corruption_fails_open() {
        let backend = InMemoryBackend::new();
        open(&backend).put(&record("a", 1, "A")).unwrap();
        backend.corrupt_byte(14);

        let result = DurableTable::open(Box::new(backend.clone()), false);
        assert!(matches!(result, Err(e) if e.is_storage_failure()));
    }

    #[test]
    fn scan_is_lazy_and_restartable() {
        let table = open(&InMemoryBackend::new());
        for id in ["c", "a", "b"] {
            table.put(&record(id, 1, id)).unwrap();
        }

        let mut scan = table.scan();
        let first = scan.next().unwrap().unwrap();
        assert_eq!(first.id.as_str(), "a");

        table.put(&record("b", 2, "b2")).unwrap();
        let second = scan.next().unwrap().unwrap();
        assert_eq!(second.version, Version::new(2));

        scan.restart();
        let ids: Vec<String> = scan.map(|r| r.unwrap().id.to_string()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn stats() {
        let table = open(&InMemoryBackend::new());
        table.put(&record("a", 1, "A")).unwrap();
        table.put(&record("b", 1, "B")).unwrap();
        table.delete(&"b".into()).unwrap();

        let stats = table.stats().unwrap();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.tombstones, 1);
        assert!(stats.bytes > 0);
    }

    #[test]
    fn compact_keeps_current_records_only() {
        let backend = InMemoryBackend::new();
        let table = open(&backend);
        for version in 1..=20 {
            table.put(&record("a", version, "A")).unwrap();
        }
        table.put(&record("b", 1, "B")).unwrap();
        table.delete(&"b".into()).unwrap();
        table.put(&record("c", 1, "C")).unwrap();
        table.delete(&"c".into()).unwrap();
        table.purge(&"c".into()).unwrap();

        assert!(table.needs_compaction(0));
        let before = table.stats().unwrap();
        assert!(before.dead_bytes > before.bytes / 2);

        let fresh = InMemoryBackend::new();
        let mut committed = false;
        let compaction = table
            .compact(Box::new(fresh.clone()), || {
                committed = true;
                Ok(())
            })
            .unwrap();
        assert!(committed);
        assert_eq!(compaction.records, 2);
        assert_eq!(compaction.bytes_before, before.bytes);
        assert!(compaction.bytes_after < compaction.bytes_before);

        let after = table.stats().unwrap();
        assert_eq!(after.dead_bytes, 0);
        assert_eq!(after.live, 1);
        assert_eq!(after.tombstones, 1);
        assert!(!table.needs_compaction(0));
        assert_eq!(table.get(&"a".into()).unwrap(), Some(record("a", 20, "A")));
        assert!(table.get(&"b".into()).unwrap().unwrap().deleted);

        table.put(&record("d", 1, "D")).unwrap();
        drop(table);
        let reopened = open(&fresh);
        assert_eq!(reopened.len(), 3);
        assert_eq!(reopened.get(&"a".into()).unwrap(), Some(record("a", 20, "A")));
    }

    #[test]
    fn failed_commit_keeps_old_backend() {
        let backend = InMemoryBackend::new();
        let table = open(&backend);
        table.put(&record("a", 1, "A")).unwrap();
        table.put(&record("a", 2, "A2")).unwrap();

        let result = table.compact(Box::new(InMemoryBackend::new()), || {
            Err(CoreError::invalid_operation("rename failed"))
        });
        assert!(result.is_err());

        table.put(&record("b", 1, "B")).unwrap();
        let reopened = open(&backend);
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get(&"a".into()).unwrap(), Some(record("a", 2, "A2")));
    }

    #[test]
    fn storage_failure_surfaces() {
        let (backend, switch) = FaultyBackend::new(InMemoryBackend::new());
        let table = DurableTable::open(Box::new(backend), true).unwrap();
        table.put(&record("a", 1, "A")).unwrap();

        switch.fail();
        let put = table.put(&record("b", 1, "B"));
        assert!(matches!(put, Err(e) if e.is_storage_failure()));
        assert!(table.get(&"a".into()).is_err());
        assert!(!table.contains(&"b".into()));

        switch.heal();
        assert!(table.get(&"a".into()).unwrap().is_some());
    }
}

//! Fault-injecting backend wrapper.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared switch that makes a [`FaultyBackend`] fail.
///
/// Clones control the same backend.
#[derive(Debug, Clone, Default)]
pub struct FaultSwitch {
    failing: Arc<AtomicBool>,
}

impl FaultSwitch {
    /// Creates a switch in the healthy position.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Restores normal operation.
    pub fn heal(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    /// Returns true while operations are failing.
    #[must_use]
    pub fn is_failing(&self) -> bool {
        self.failing.load(Ordering::SeqCst)
    }
}

/// Wraps a backend and fails every operation while its [`FaultSwitch`] is on.
///
/// Lets tests drive the storage-failure paths of the table, the change log
/// and the sync coordinator without a broken disk.
#[derive(Debug)]
pub struct FaultyBackend<B> {
    inner: B,
    switch: FaultSwitch,
}

impl<B: StorageBackend> FaultyBackend<B> {
    /// Wraps `inner`; returns the backend and the switch controlling it.
    pub fn new(inner: B) -> (Self, FaultSwitch) {
        let switch = FaultSwitch::new();
        (
            Self {
                inner,
                switch: switch.clone(),
            },
            switch,
        )
    }

    fn check(&self) -> StorageResult<()> {
        if self.switch.is_failing() {
            Err(StorageError::Unavailable("injected fault".into()))
        } else {
            Ok(())
        }
    }
}

impl<B: StorageBackend> StorageBackend for FaultyBackend<B> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.check()?;
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.check()?;
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.check()?;
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.check()?;
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.check()?;
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.check()?;
        self.inner.truncate(new_size)
    }
}

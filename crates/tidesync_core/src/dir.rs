//! Store directory management.
//!
//! ```text
//! <store_path>/
//! ├─ LOCK          # Advisory lock for single-process access
//! ├─ records.dat   # Durable record table
//! ├─ records.dat.compact  # Table being rewritten (transient)
//! └─ changes.log   # Change log
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const TABLE_FILE: &str = "records.dat";
const LOG_FILE: &str = "changes.log";
const COMPACT_FILE: &str = "records.dat.compact";

/// Holds the exclusive lock on a store directory.
///
/// Only one `StoreDir` can exist per directory at a time; the lock is
/// released when it is dropped.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `StoreLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_operation(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_operation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::StoreLocked);
        }

        // Left behind by a compaction that never committed.
        let stale = path.join(COMPACT_FILE);
        if stale.exists() {
            fs::remove_file(&stale)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the record table file.
    #[must_use]
    pub fn table_path(&self) -> PathBuf {
        self.path.join(TABLE_FILE)
    }

    /// Returns the path to the change-log file.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    /// Returns the path a compacted record table is written to before it
    /// replaces [`table_path`](Self::table_path).
    #[must_use]
    pub fn compact_path(&self) -> PathBuf {
        self.path.join(COMPACT_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("new_store");

        let dir = StoreDir::open(&path, true).unwrap();
        assert!(path.is_dir());
        assert_eq!(dir.path(), path);
    }

    #[test]
    fn open_fails_if_not_exists_and_no_create() {
        let temp = tempdir().unwrap();
        let result = StoreDir::open(&temp.path().join("nonexistent"), false);
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("locked");

        let _first = StoreDir::open(&path, true).unwrap();
        let result = StoreDir::open(&path, true);
        assert!(matches!(result, Err(CoreError::StoreLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("reopen");

        drop(StoreDir::open(&path, true).unwrap());
        let _again = StoreDir::open(&path, true).unwrap();
    }

    #[test]
    fn paths_are_correct() {
        let temp = tempdir().unwrap();
        let dir = StoreDir::open(temp.path(), true).unwrap();

        assert_eq!(dir.table_path(), temp.path().join("records.dat"));
        assert_eq!(dir.log_path(), temp.path().join("changes.log"));
        assert_eq!(dir.compact_path(), temp.path().join("records.dat.compact"));
    }

    #[test]
    fn open_removes_stale_compaction_file() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("records.dat.compact"), b"partial").unwrap();

        let dir = StoreDir::open(temp.path(), true).unwrap();
        assert!(!dir.compact_path().exists());
    }
}

//! # TideSync Core
//!
//! The device-local half of TideSync.
//!
//! This crate provides:
//! - [`DurableTable`], a crash-durable table with one current [`Record`] per ID
//! - [`ChangeLog`], the ordered log of writes the remote has not confirmed
//! - [`LocalStore`], the application write path over both, with crash
//!   recovery and the apply step used by the sync engine
//!
//! Both files are append-only frame logs on a
//! [`StorageBackend`](tidesync_storage::StorageBackend) and are replayed on
//! open.
//!
//! ## Example
//!
//! ```rust
//! use tidesync_core::{LocalStore, Payload};
//!
//! let store = LocalStore::in_memory().unwrap();
//! store.write("note-1", Payload::Text("hello".into())).unwrap();
//!
//! assert_eq!(store.log().pending_count(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_log;
mod config;
mod dir;
mod error;
mod frame;
mod record;
mod store;
mod table;
mod types;

pub use change_log::{ChangeLog, LOG_MAGIC};
pub use config::StoreConfig;
pub use dir::StoreDir;
pub use error::{CoreError, CoreResult};
pub use frame::{compute_crc32, FRAME_VERSION};
pub use record::{ChangeLogEntry, DeadLetter, Operation, Record, SyncState};
pub use store::{Applied, LocalStore, Reconciled, StoreStats};
pub use table::{Compaction, DurableTable, TableScan, TableStats, TABLE_MAGIC};
pub use types::{Payload, RecordId, SequenceNo, Timestamp, Version};

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! # TideSync Storage
//!
//! Byte-store backends underneath the TideSync local store.
//!
//! Backends are **opaque append-only byte stores**. The record table and the
//! change log in `tidesync_core` frame, checksum and interpret everything
//! they write; a backend only has to hand the same bytes back.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - ephemeral stores and tests; clones share one buffer,
//!   so a test can drop a store and reopen it over the surviving bytes
//! - [`FileBackend`] - persistent storage on a single OS file
//! - [`FaultyBackend`] - wrapper that fails on demand, for exercising
//!   storage-failure paths
//!
//! ## Example
//!
//! ```rust
//! use tidesync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"frame").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"frame");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod faulty;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use faulty::{FaultSwitch, FaultyBackend};
pub use file::FileBackend;
pub use memory::InMemoryBackend;

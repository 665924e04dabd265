//! # TideSync Sync Engine
//!
//! Background synchronization between a [`tidesync_core::LocalStore`] and a
//! remote authority.
//!
//! This crate provides:
//! - [`RemoteGateway`], the async push/pull seam to the remote
//! - [`SyncCoordinator`], the `Idle → Draining → Reconciling → Applying`
//!   state machine
//! - [`ConnectivityMonitor`], debounced reachability with sync triggers
//! - [`SyncWorker`], a cancellable task that runs the coordinator on
//!   triggers and retries aborted runs with exponential backoff
//!
//! ## Architecture
//!
//! Application writes go to the local store and its change log before any
//! network call. The monitor and the write path send [`Trigger`]s into the
//! worker's channel; the worker runs the coordinator, which pushes pending
//! entries, resolves conflicts, and applies the outcomes locally.
//!
//! ## Key Invariants
//!
//! - Only one coordinator run is active at a time
//! - A local write made during a run always wins over that run's result
//! - Network failures, timeouts and cancellation never drop an entry
//! - Entries the remote rejects become dead letters and are never retried
//!   automatically
//!
//! ```no_run
//! use std::sync::Arc;
//! use tidesync_core::LocalStore;
//! use tidesync_sync_engine::{
//!     trigger_channel, ConnectivityMonitor, InMemoryRemote, MonitorConfig, SyncConfig,
//!     SyncCoordinator, SyncWorker, Trigger,
//! };
//! use tidesync_sync_protocol::LastWriterWins;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let cancel = CancellationToken::new();
//! let (tx, rx) = trigger_channel();
//! let monitor = ConnectivityMonitor::spawn(MonitorConfig::default(), Some(tx.clone()), &cancel);
//!
//! let store = Arc::new(LocalStore::in_memory()?);
//! let coordinator = Arc::new(SyncCoordinator::new(
//!     store.clone(),
//!     Arc::new(InMemoryRemote::new()),
//!     Arc::new(LastWriterWins),
//!     monitor.status(),
//!     SyncConfig::default(),
//! ));
//! let handle = SyncWorker::spawn(coordinator, (tx, rx), cancel);
//!
//! store.write("n1", "hello".into())?;
//! handle.notify_write();
//! monitor.report(true);
//!
//! handle.trigger(Trigger::Manual).await?;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod coordinator;
mod error;
mod gateway;
mod monitor;
mod worker;

pub use config::{MonitorConfig, RetryConfig, SyncConfig};
pub use coordinator::{
    AbortReason, CoordinatorState, EntryOutcome, EntryReport, RunOutcome, SessionStatus,
    SkipReason, SyncCoordinator, SyncSession, SyncStats,
};
pub use error::{SyncError, SyncResult};
pub use gateway::{InMemoryRemote, PushAttempt, RemoteGateway, ScriptStep, ScriptedGateway};
pub use monitor::{ConnectivityEvent, ConnectivityMonitor, ConnectivityStatus};
pub use worker::{trigger_channel, SyncHandle, SyncWorker, Trigger, TRIGGER_CAPACITY};

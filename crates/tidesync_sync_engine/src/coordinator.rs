//! Sync coordinator state machine.
//!
//! One run drains the change log in batches. Each batch moves through
//! `Draining → Reconciling → Applying` and back to `Idle`:
//!
//! 1. **Draining** takes up to `batch_size` pending entries and marks them
//!    in flight.
//! 2. **Reconciling** pushes each entry and decides its local outcome,
//!    asking the conflict resolver when the remote has diverged.
//! 3. **Applying** writes the decided outcomes to the local store, settles
//!    the entries and dead-letters the ones the remote refused.
//!
//! A network failure, timeout or cancellation stops the batch: outcomes
//! already decided are applied and every other entry reverts to pending.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::gateway::RemoteGateway;
use crate::monitor::ConnectivityStatus;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidesync_core::{
    Applied, ChangeLogEntry, DeadLetter, LocalStore, Operation, Reconciled, Record, RecordId,
    SequenceNo, Timestamp, Version,
};
use tidesync_sync_protocol::{resolve_conflict, ConflictResolver, Decision, PushOutcome};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEAD_LETTER_CAPACITY: usize = 64;

/// Phase of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// No run in progress.
    Idle,
    /// Taking a batch from the change log.
    Draining,
    /// Pushing the batch and deciding outcomes.
    Reconciling,
    /// Writing outcomes to the local store.
    Applying,
}

impl CoordinatorState {
    /// Returns true while a run is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(self, CoordinatorState::Idle)
    }
}

/// Overall result of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Every entry was settled.
    Success,
    /// Some entries were dead-lettered; the rest were settled.
    PartialFailure,
    /// The batch stopped early; undecided entries are pending again.
    Aborted,
}

/// Why a batch stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The remote could not be reached.
    Network(String),
    /// A push took longer than the configured timeout.
    Timeout,
    /// The run was cancelled.
    Cancelled,
}

impl AbortReason {
    /// Returns true if a later retry may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AbortReason::Cancelled)
    }
}

/// What happened to one entry of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    /// The remote accepted the change.
    Accepted(Applied),
    /// The remote had diverged and the resolver decided.
    Resolved {
        /// The resolver's decision.
        decision: Decision,
        /// What the local store did with it.
        applied: Applied,
    },
    /// The remote refused the change; it is now a dead letter.
    DeadLettered(String),
    /// The entry was not decided and is pending again.
    Reverted,
}

/// Outcome for one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryReport {
    /// Sequence number of the entry.
    pub sequence: SequenceNo,
    /// Record the entry targets.
    pub record_id: RecordId,
    /// What happened.
    pub outcome: EntryOutcome,
}

/// Record of one batch.
#[derive(Debug, Clone)]
pub struct SyncSession {
    /// Per-entry outcomes in batch order.
    pub entries: Vec<EntryReport>,
    /// Overall status.
    pub status: SessionStatus,
    /// Why the batch stopped early, if it did.
    pub abort: Option<AbortReason>,
    /// Time spent on the batch.
    pub duration: Duration,
}

impl SyncSession {
    /// Number of entries with the given outcome kind.
    pub fn count(&self, matches: impl Fn(&EntryOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| matches(&e.outcome)).count()
    }
}

/// Why a run did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The settled connectivity state is offline.
    Offline,
    /// The change log has nothing pending.
    NothingToSync,
    /// Another run is active; it will run again when it finishes.
    AlreadyRunning,
}

/// Result of [`SyncCoordinator::run`].
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// At least one batch was processed.
    Completed(Vec<SyncSession>),
    /// The run did nothing.
    Skipped(SkipReason),
}

impl RunOutcome {
    /// Returns the processed batches.
    pub fn sessions(&self) -> &[SyncSession] {
        match self {
            RunOutcome::Completed(sessions) => sessions,
            RunOutcome::Skipped(_) => &[],
        }
    }

    /// Returns the worst status across all batches, or `None` if skipped.
    pub fn status(&self) -> Option<SessionStatus> {
        let sessions = self.sessions();
        if sessions.is_empty() {
            return None;
        }
        if sessions.iter().any(|s| s.status == SessionStatus::Aborted) {
            Some(SessionStatus::Aborted)
        } else if sessions
            .iter()
            .any(|s| s.status == SessionStatus::PartialFailure)
        {
            Some(SessionStatus::PartialFailure)
        } else {
            Some(SessionStatus::Success)
        }
    }

    /// Returns the reason the last batch stopped early.
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        self.sessions().last().and_then(|s| s.abort.as_ref())
    }
}

/// Statistics about sync runs.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Runs that processed at least one batch.
    pub runs: u64,
    /// Batches processed.
    pub sessions: u64,
    /// Push calls made.
    pub pushed: u64,
    /// Pushes the remote accepted.
    pub accepted: u64,
    /// Conflicts handed to the resolver.
    pub conflicts: u64,
    /// Entries moved to dead letters.
    pub dead_lettered: u64,
    /// Results discarded because of a newer local write.
    pub superseded: u64,
    /// Batches that stopped early.
    pub aborted: u64,
    /// Retries scheduled after an aborted run.
    pub retries: u64,
    /// Records written by hydration.
    pub hydrated: u64,
    /// When the last run finished.
    pub last_sync: Option<Instant>,
    /// Last error or abort reason.
    pub last_error: Option<String>,
}

enum Verdict {
    Accepted(Record),
    Resolved(Decision, Record),
    Rejected(String),
}

/// Drives synchronization between a local store and a remote gateway.
pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    gateway: Arc<dyn RemoteGateway>,
    resolver: Arc<dyn ConflictResolver>,
    connectivity: ConnectivityStatus,
    config: SyncConfig,
    state: RwLock<CoordinatorState>,
    stats: RwLock<SyncStats>,
    running: AtomicBool,
    rerun: AtomicBool,
    dead_letters: broadcast::Sender<DeadLetter>,
}

/// Ends a run: reverts whatever it left in flight and clears the
/// single-flight flag. Runs on error and when the run future is dropped
/// mid-push.
struct RunGuard<'a> {
    coordinator: &'a SyncCoordinator,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.abandon_in_flight();
        self.coordinator.set_state(CoordinatorState::Idle);
        self.coordinator.running.store(false, Ordering::Release);
    }
}

impl SyncCoordinator {
    /// Creates a coordinator.
    pub fn new(
        store: Arc<LocalStore>,
        gateway: Arc<dyn RemoteGateway>,
        resolver: Arc<dyn ConflictResolver>,
        connectivity: ConnectivityStatus,
        config: SyncConfig,
    ) -> Self {
        let (dead_letters, _) = broadcast::channel(DEAD_LETTER_CAPACITY);
        Self {
            store,
            gateway,
            resolver,
            connectivity,
            config,
            state: RwLock::new(CoordinatorState::Idle),
            stats: RwLock::new(SyncStats::default()),
            running: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            dead_letters,
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns the local store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Subscribes to entries moved to dead letters.
    pub fn subscribe_dead_letters(&self) -> broadcast::Receiver<DeadLetter> {
        self.dead_letters.subscribe()
    }

    /// Returns true if a run is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Takes the "run again" request left by a skipped or cut-short run.
    pub fn take_rerun(&self) -> bool {
        self.rerun.swap(false, Ordering::AcqRel)
    }

    /// Counts a retry scheduled by the caller.
    pub fn record_retry(&self) {
        self.stats.write().retries += 1;
    }

    fn set_state(&self, state: CoordinatorState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "coordinator state");
        }
    }

    /// Runs sync until the change log has nothing pending.
    ///
    /// Only one run is active at a time. A call made while a run is active
    /// returns [`SkipReason::AlreadyRunning`] and makes the active run do
    /// another pass before it finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store fails or a conflict cannot be
    /// resolved. Entries of the failed batch are pending again.
    pub async fn run(&self, cancel: &CancellationToken) -> SyncResult<RunOutcome> {
        if self.running.swap(true, Ordering::AcqRel) {
            self.rerun.store(true, Ordering::Release);
            debug!("sync already running, coalescing trigger");
            return Ok(RunOutcome::Skipped(SkipReason::AlreadyRunning));
        }
        let _guard = RunGuard { coordinator: self };
        self.rerun.store(false, Ordering::Release);

        if !self.connectivity.is_online() {
            debug!("offline, skipping sync");
            return Ok(RunOutcome::Skipped(SkipReason::Offline));
        }
        if self.store.log().pending_count() == 0 {
            return Ok(RunOutcome::Skipped(SkipReason::NothingToSync));
        }

        let mut sessions = Vec::new();
        for _ in 0..self.config.max_passes {
            self.rerun.store(false, Ordering::Release);

            let session = match self.pass(cancel).await {
                Ok(Some(session)) => session,
                Ok(None) => break,
                Err(err) => {
                    self.stats.write().last_error = Some(err.to_string());
                    return Err(err);
                }
            };
            let aborted = session.status == SessionStatus::Aborted;
            sessions.push(session);
            if aborted || !self.connectivity.is_online() {
                break;
            }

            let requested = self.rerun.swap(false, Ordering::AcqRel);
            if !requested && self.store.log().pending_count() == 0 {
                break;
            }
        }

        let aborted = sessions
            .last()
            .is_some_and(|s| s.status == SessionStatus::Aborted);
        if !aborted && self.store.log().pending_count() > 0 {
            // Out of passes with work left.
            self.rerun.store(true, Ordering::Release);
        }

        self.store.trim()?;
        self.finish_run(&sessions);
        Ok(RunOutcome::Completed(sessions))
    }

    fn finish_run(&self, sessions: &[SyncSession]) {
        let mut stats = self.stats.write();
        stats.runs += 1;
        stats.last_sync = Some(Instant::now());
        if let Some(abort) = sessions.last().and_then(|s| s.abort.as_ref()) {
            stats.last_error = Some(format!("{abort:?}"));
        }
        info!(
            batches = sessions.len(),
            pending = self.store.log().pending_count(),
            "sync run finished"
        );
    }

    async fn pass(&self, cancel: &CancellationToken) -> SyncResult<Option<SyncSession>> {
        let started = Instant::now();

        self.set_state(CoordinatorState::Draining);
        let batch = self.store.log().peek_batch(self.config.batch_size);
        if batch.is_empty() {
            return Ok(None);
        }
        debug!(size = batch.len(), "drained batch");

        self.set_state(CoordinatorState::Reconciling);
        let mut decided = Vec::with_capacity(batch.len());
        let mut undecided = Vec::new();
        let mut abort = None;
        let mut unresolved = None;

        let mut entries = batch.into_iter();
        for entry in entries.by_ref() {
            self.stats.write().pushed += 1;
            match self.push_one(&entry, cancel).await {
                Ok(PushOutcome::Accepted(server)) => {
                    debug!(id = %entry.record_id, seq = %entry.sequence, version = %server.version, "push accepted");
                    self.stats.write().accepted += 1;
                    decided.push((entry, Verdict::Accepted(server)));
                }
                Ok(PushOutcome::Conflict(server)) => {
                    self.stats.write().conflicts += 1;
                    match resolve_conflict(self.resolver.as_ref(), &entry.snapshot, &server) {
                        Ok(decision) => {
                            debug!(id = %entry.record_id, %decision, resolver = self.resolver.name(), "conflict resolved");
                            decided.push((entry, Verdict::Resolved(decision, server)));
                        }
                        Err(err) => {
                            warn!(id = %entry.record_id, %err, "conflict resolver failed");
                            undecided.push(entry);
                            unresolved = Some(err);
                            break;
                        }
                    }
                }
                Err(SyncError::Rejected { reason }) => {
                    warn!(id = %entry.record_id, seq = %entry.sequence, %reason, "push rejected");
                    decided.push((entry, Verdict::Rejected(reason)));
                }
                Err(err) => {
                    let reason = match err {
                        SyncError::Cancelled => AbortReason::Cancelled,
                        SyncError::Timeout => AbortReason::Timeout,
                        other => AbortReason::Network(other.to_string()),
                    };
                    info!(id = %entry.record_id, ?reason, "batch stopped");
                    undecided.push(entry);
                    abort = Some(reason);
                    break;
                }
            }
        }
        undecided.extend(entries);

        self.set_state(CoordinatorState::Applying);
        let mut reports = match self.apply_decisions(decided) {
            Ok(reports) => reports,
            Err(err) => {
                self.abandon_in_flight();
                return Err(err);
            }
        };

        if let Some(err) = unresolved {
            self.abandon_in_flight();
            return Err(err.into());
        }

        for entry in undecided {
            if let Err(err) = self.store.log().mark_failed(entry.sequence) {
                self.abandon_in_flight();
                return Err(err.into());
            }
            reports.push(EntryReport {
                sequence: entry.sequence,
                record_id: entry.record_id,
                outcome: EntryOutcome::Reverted,
            });
        }

        let status = if abort.is_some() {
            SessionStatus::Aborted
        } else if reports
            .iter()
            .any(|r| matches!(r.outcome, EntryOutcome::DeadLettered(_)))
        {
            SessionStatus::PartialFailure
        } else {
            SessionStatus::Success
        };

        {
            let mut stats = self.stats.write();
            stats.sessions += 1;
            if status == SessionStatus::Aborted {
                stats.aborted += 1;
            }
        }
        self.set_state(CoordinatorState::Idle);

        Ok(Some(SyncSession {
            entries: reports,
            status,
            abort,
            duration: started.elapsed(),
        }))
    }

    async fn push_one(
        &self,
        entry: &ChangeLogEntry,
        cancel: &CancellationToken,
    ) -> SyncResult<PushOutcome> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = tokio::time::timeout(self.config.push_timeout, self.gateway.push(entry)) => {
                match result {
                    Ok(outcome) => outcome.map_err(SyncError::from),
                    Err(_) => Err(SyncError::Timeout),
                }
            }
        }
    }

    fn apply_decisions(
        &self,
        decided: Vec<(ChangeLogEntry, Verdict)>,
    ) -> SyncResult<Vec<EntryReport>> {
        let mut reports = Vec::with_capacity(decided.len());

        for (entry, verdict) in decided {
            let outcome = match verdict {
                Verdict::Accepted(server) => {
                    let reconciled = if entry.operation == Operation::Delete {
                        Reconciled::Purge
                    } else {
                        Reconciled::Store(server)
                    };
                    EntryOutcome::Accepted(self.apply_one(&entry, reconciled)?)
                }
                Verdict::Resolved(decision, server) => {
                    let reconciled = match &decision {
                        Decision::TakeRemote => Reconciled::Store(server),
                        Decision::TakeLocal => {
                            Reconciled::Requeue(rebase(entry.snapshot.clone(), &server))
                        }
                        Decision::Merge(merged) => {
                            Reconciled::Requeue(rebase(merged.clone(), &server))
                        }
                    };
                    let applied = self.apply_one(&entry, reconciled)?;
                    EntryOutcome::Resolved { decision, applied }
                }
                Verdict::Rejected(reason) => {
                    let letter =
                        self.store
                            .dead_letter(entry.sequence, reason.clone(), Timestamp::now())?;
                    self.stats.write().dead_lettered += 1;
                    // Nobody listening is fine; the letter stays in the store.
                    let _ = self.dead_letters.send(letter);
                    EntryOutcome::DeadLettered(reason)
                }
            };

            reports.push(EntryReport {
                sequence: entry.sequence,
                record_id: entry.record_id,
                outcome,
            });
        }

        Ok(reports)
    }

    fn apply_one(&self, entry: &ChangeLogEntry, reconciled: Reconciled) -> SyncResult<Applied> {
        let applied = self.store.apply(entry, reconciled)?;
        if applied == Applied::Superseded {
            self.stats.write().superseded += 1;
        }
        Ok(applied)
    }

    fn abandon_in_flight(&self) {
        match self.store.log().revert_in_flight() {
            Ok(reverted) if reverted > 0 => warn!(reverted, "reverted in-flight entries"),
            Ok(_) => {}
            Err(err) => warn!(%err, "could not revert in-flight entries"),
        }
    }

    /// Pulls remote records newer than `since` into the local store.
    ///
    /// Records with unsynced local changes are left alone. Returns the
    /// highest version seen, to pass as `since` next time.
    ///
    /// # Errors
    ///
    /// Returns an error if the pull fails or the local store fails.
    pub async fn hydrate(&self, since: Version) -> SyncResult<Version> {
        let records = tokio::time::timeout(self.config.push_timeout, self.gateway.pull(since))
            .await
            .map_err(|_| SyncError::Timeout)??;

        let mut highest = since;
        let mut written = 0u64;
        for record in &records {
            highest = highest.max(record.version);
            if self.store.hydrate_record(record)? {
                written += 1;
            }
        }

        self.stats.write().hydrated += written;
        info!(pulled = records.len(), written, %highest, "hydrated from remote");
        Ok(highest)
    }
}

/// Moves a locally kept record past the server's version so the next push
/// is accepted.
fn rebase(record: Record, server: &Record) -> Record {
    Record {
        version: server.version.next(),
        ..record
    }
}

//! Remote gateway abstraction.
//!
//! The coordinator talks to the remote authority only through
//! [`RemoteGateway`]. A real implementation wraps an HTTP or GraphQL client;
//! [`InMemoryRemote`] and [`ScriptedGateway`] stand in for it in tests and
//! local tooling.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tidesync_core::{ChangeLogEntry, Operation, Record, RecordId, SequenceNo, Version};
use tidesync_sync_protocol::{GatewayError, PushOutcome};
use tokio::time::Instant;

/// Push/pull access to the remote authority.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Pushes one change.
    ///
    /// Returns the server's copy on acceptance, or the diverged server
    /// record on conflict.
    async fn push(&self, entry: &ChangeLogEntry) -> Result<PushOutcome, GatewayError>;

    /// Returns every remote record with a version greater than `since`.
    async fn pull(&self, since: Version) -> Result<Vec<Record>, GatewayError>;
}

#[async_trait]
impl<G: RemoteGateway + ?Sized> RemoteGateway for Arc<G> {
    async fn push(&self, entry: &ChangeLogEntry) -> Result<PushOutcome, GatewayError> {
        (**self).push(entry).await
    }

    async fn pull(&self, since: Version) -> Result<Vec<Record>, GatewayError> {
        (**self).pull(since).await
    }
}

#[derive(Default)]
struct RemoteState {
    records: BTreeMap<RecordId, Record>,
    rejections: HashMap<RecordId, String>,
    offline: bool,
    pushes: u64,
}

/// An authoritative remote held in memory.
///
/// The remote accepts a change whose snapshot version is newer than its own
/// copy and stamps it with the next server version. Anything else is a
/// conflict. Deletions are kept as tombstones so pulls propagate them.
#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
}

impl InMemoryRemote {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record` directly, as if another device had pushed it.
    pub fn insert(&self, record: Record) {
        self.state.lock().records.insert(record.id.clone(), record);
    }

    /// Returns the server copy of `id`.
    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.state.lock().records.get(id).cloned()
    }

    /// Returns all server records in ID order.
    pub fn records(&self) -> Vec<Record> {
        self.state.lock().records.values().cloned().collect()
    }

    /// Makes every call fail with a network error while `offline` is set.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Refuses every future push for `id` with `reason`.
    pub fn reject(&self, id: impl Into<RecordId>, reason: impl Into<String>) {
        self.state.lock().rejections.insert(id.into(), reason.into());
    }

    /// Stops refusing pushes for `id`.
    pub fn allow(&self, id: &RecordId) {
        self.state.lock().rejections.remove(id);
    }

    /// Number of pushes that reached the remote.
    pub fn push_count(&self) -> u64 {
        self.state.lock().pushes
    }

    fn apply_push(&self, entry: &ChangeLogEntry) -> Result<PushOutcome, GatewayError> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(GatewayError::Network("remote unreachable".into()));
        }
        state.pushes += 1;

        if let Some(reason) = state.rejections.get(&entry.record_id) {
            return Err(GatewayError::Rejected(reason.clone()));
        }

        let current = state.records.get(&entry.record_id);
        if let Some(server) = current {
            if entry.snapshot.version <= server.version {
                return Ok(PushOutcome::Conflict(server.clone()));
            }
        }

        let version = current.map_or(Version::INITIAL, |server| server.version.next());
        let mut accepted = Record {
            version,
            ..entry.snapshot.clone()
        };
        if entry.operation == Operation::Delete {
            accepted.deleted = true;
        }
        state
            .records
            .insert(accepted.id.clone(), accepted.clone());
        Ok(PushOutcome::Accepted(accepted))
    }
}

#[async_trait]
impl RemoteGateway for InMemoryRemote {
    async fn push(&self, entry: &ChangeLogEntry) -> Result<PushOutcome, GatewayError> {
        self.apply_push(entry)
    }

    async fn pull(&self, since: Version) -> Result<Vec<Record>, GatewayError> {
        let state = self.state.lock();
        if state.offline {
            return Err(GatewayError::Network("remote unreachable".into()));
        }
        Ok(state
            .records
            .values()
            .filter(|r| r.version > since)
            .cloned()
            .collect())
    }
}

/// One scripted reaction to a push.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Answer with this result.
    Respond(Result<PushOutcome, GatewayError>),
    /// Never answer.
    Stall,
    /// Hand the push to the backing remote.
    Forward,
}

/// A push observed by a [`ScriptedGateway`].
#[derive(Debug, Clone)]
pub struct PushAttempt {
    /// When the push started.
    pub at: Instant,
    /// Sequence number of the pushed entry.
    pub sequence: SequenceNo,
    /// Record the push targeted.
    pub record_id: RecordId,
}

/// A gateway that replays a script of push reactions.
///
/// Once the script runs out, pushes go to the backing [`InMemoryRemote`] if
/// there is one and fail with a network error otherwise. Pulls always go to
/// the backing remote.
pub struct ScriptedGateway {
    script: Mutex<VecDeque<ScriptStep>>,
    remote: Option<Arc<InMemoryRemote>>,
    attempts: Mutex<Vec<PushAttempt>>,
}

impl ScriptedGateway {
    /// Creates a gateway with an empty script and no backing remote.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            remote: None,
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Creates a gateway backed by `remote`.
    pub fn backed_by(remote: Arc<InMemoryRemote>) -> Self {
        Self {
            remote: Some(remote),
            ..Self::new()
        }
    }

    /// Appends a step to the script.
    pub fn push_step(&self, step: ScriptStep) {
        self.script.lock().push_back(step);
    }

    /// Appends `count` network failures to the script.
    pub fn fail_network(&self, count: usize) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(ScriptStep::Respond(Err(GatewayError::Network(
                "connection reset".into(),
            ))));
        }
    }

    /// Returns the pushes observed so far.
    pub fn attempts(&self) -> Vec<PushAttempt> {
        self.attempts.lock().clone()
    }

    /// Returns the number of unplayed script steps.
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteGateway for ScriptedGateway {
    async fn push(&self, entry: &ChangeLogEntry) -> Result<PushOutcome, GatewayError> {
        self.attempts.lock().push(PushAttempt {
            at: Instant::now(),
            sequence: entry.sequence,
            record_id: entry.record_id.clone(),
        });

        let step = self.script.lock().pop_front().unwrap_or(ScriptStep::Forward);
        match step {
            ScriptStep::Respond(result) => result,
            ScriptStep::Stall => std::future::pending().await,
            ScriptStep::Forward => match &self.remote {
                Some(remote) => remote.push(entry).await,
                None => Err(GatewayError::Network("no remote configured".into())),
            },
        }
    }

    async fn pull(&self, since: Version) -> Result<Vec<Record>, GatewayError> {
        match &self.remote {
            Some(remote) => remote.pull(since).await,
            None => Ok(Vec::new()),
        }
    }
}

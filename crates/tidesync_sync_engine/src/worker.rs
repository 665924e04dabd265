//! Background sync worker.
//!
//! The worker is a cooperative tokio task that sleeps until a [`Trigger`]
//! arrives or a retry timer fires, then runs the coordinator. Aborted runs
//! are retried with exponential backoff.

use crate::config::RetryConfig;
use crate::coordinator::{RunOutcome, SkipReason, SyncCoordinator};
use crate::error::{SyncError, SyncResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the trigger channel.
pub const TRIGGER_CAPACITY: usize = 32;

/// A reason to run sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Trigger {
    /// The application wrote locally.
    LocalWrite,
    /// The retry timer fired.
    Retry,
    /// Connectivity was restored.
    ConnectivityRestored,
    /// The application asked for a sync.
    Manual,
}

impl Trigger {
    /// Returns true if the trigger should cut a pending backoff short.
    pub fn overrides_backoff(&self) -> bool {
        !matches!(self, Trigger::LocalWrite)
    }
}

/// Creates the channel that feeds a [`SyncWorker`].
pub fn trigger_channel() -> (mpsc::Sender<Trigger>, mpsc::Receiver<Trigger>) {
    mpsc::channel(TRIGGER_CAPACITY)
}

/// Handle to a running [`SyncWorker`].
pub struct SyncHandle {
    triggers: mpsc::Sender<Trigger>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Sends a trigger to the worker.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::WorkerStopped`] if the worker has exited.
    pub async fn trigger(&self, trigger: Trigger) -> SyncResult<()> {
        self.triggers
            .send(trigger)
            .await
            .map_err(|_| SyncError::WorkerStopped)
    }

    /// Signals a local write without waiting. A full channel already holds
    /// a trigger, so the signal is dropped.
    pub fn notify_write(&self) {
        if let Err(mpsc::error::TrySendError::Closed(_)) =
            self.triggers.try_send(Trigger::LocalWrite)
        {
            debug!("sync worker stopped, write signal dropped");
        }
    }

    /// Returns a sender for the trigger channel.
    pub fn sender(&self) -> mpsc::Sender<Trigger> {
        self.triggers.clone()
    }

    /// Returns the token that stops the worker and cancels its run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns true once the worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the worker and waits for it to exit.
    ///
    /// A run in progress is cancelled; its in-flight entries go back to
    /// pending.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(%err, "sync worker task failed");
        }
    }
}

/// Runs the coordinator in the background.
pub struct SyncWorker {
    coordinator: Arc<SyncCoordinator>,
    retry: RetryConfig,
    triggers: mpsc::Receiver<Trigger>,
    cancel: CancellationToken,
    attempt: u32,
    retry_at: Option<Instant>,
}

impl SyncWorker {
    /// Spawns a worker fed by `receiver`.
    ///
    /// `sender` must belong to the same channel; it is kept by the returned
    /// handle. Retry timing comes from the coordinator's configuration.
    pub fn spawn(
        coordinator: Arc<SyncCoordinator>,
        (sender, receiver): (mpsc::Sender<Trigger>, mpsc::Receiver<Trigger>),
        cancel: CancellationToken,
    ) -> SyncHandle {
        let retry = coordinator.config().retry.clone();
        let worker = Self {
            coordinator,
            retry,
            triggers: receiver,
            cancel: cancel.clone(),
            attempt: 0,
            retry_at: None,
        };
        let task = tokio::spawn(worker.run());

        SyncHandle {
            triggers: sender,
            cancel,
            task,
        }
    }

    async fn run(mut self) {
        info!("sync worker started");
        loop {
            let trigger = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                () = wait_until(self.retry_at) => Trigger::Retry,
                received = self.triggers.recv() => match received {
                    Some(trigger) => trigger,
                    None => break,
                },
            };
            let trigger = self.coalesce(trigger);

            if self.retry_at.is_some() && !trigger.overrides_backoff() {
                debug!(?trigger, "backoff pending, deferring");
                continue;
            }
            if trigger == Trigger::Retry {
                self.coordinator.record_retry();
            }
            self.retry_at = None;

            debug!(?trigger, "running sync");
            let result = self.coordinator.run(&self.cancel).await;
            if self.cancel.is_cancelled() {
                break;
            }
            self.settle(result);
        }
        info!("sync worker stopped");
    }

    fn coalesce(&mut self, first: Trigger) -> Trigger {
        let mut strongest = first;
        while let Ok(next) = self.triggers.try_recv() {
            strongest = strongest.max(next);
        }
        strongest
    }

    fn settle(&mut self, result: SyncResult<RunOutcome>) {
        match result {
            Ok(outcome) if outcome.abort_reason().is_some_and(|r| r.is_retryable()) => {
                self.schedule_retry();
            }
            Ok(RunOutcome::Skipped(SkipReason::Offline)) => {
                // Connectivity restoration brings the next run.
                self.attempt = 0;
            }
            Ok(_) => {
                self.attempt = 0;
                if self.coordinator.take_rerun() {
                    self.retry_at = Some(Instant::now());
                }
            }
            Err(err) => {
                error!(%err, "sync run failed");
                self.attempt = 0;
            }
        }
    }

    fn schedule_retry(&mut self) {
        self.attempt += 1;
        if !self.retry.allows(self.attempt) {
            warn!(attempts = self.attempt - 1, "giving up retries until the next trigger");
            self.attempt = 0;
            return;
        }

        let delay = self.retry.delay_for_attempt(self.attempt);
        info!(attempt = self.attempt, ?delay, "scheduling sync retry");
        self.retry_at = Some(Instant::now() + delay);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_strength() {
        assert!(Trigger::Manual > Trigger::ConnectivityRestored);
        assert!(Trigger::ConnectivityRestored > Trigger::Retry);
        assert!(Trigger::Retry > Trigger::LocalWrite);
        assert!(!Trigger::LocalWrite.overrides_backoff());
        assert!(Trigger::Retry.overrides_backoff());
    }
}

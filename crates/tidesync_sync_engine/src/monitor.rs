//! Debounced connectivity monitor.
//!
//! Platform reachability checks feed raw observations into
//! [`ConnectivityMonitor::report`]. A background task waits for each change
//! to hold for the settle window before publishing it, so short flaps never
//! reach the coordinator.

use crate::config::MonitorConfig;
use crate::worker::Trigger;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 16;

/// A settled connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// Offline to online.
    WentOnline,
    /// Online to offline.
    WentOffline,
}

/// Read-only view of the settled connectivity state.
#[derive(Debug, Clone)]
pub struct ConnectivityStatus {
    settled: watch::Receiver<bool>,
}

impl ConnectivityStatus {
    /// A status that never changes.
    pub fn fixed(online: bool) -> Self {
        let (_tx, settled) = watch::channel(online);
        Self { settled }
    }

    /// A status that is always online.
    pub fn always_online() -> Self {
        Self::fixed(true)
    }

    /// Returns the settled state.
    pub fn is_online(&self) -> bool {
        *self.settled.borrow()
    }
}

/// Debounces raw reachability reports into settled transitions.
pub struct ConnectivityMonitor {
    raw: watch::Sender<bool>,
    settled: watch::Receiver<bool>,
    events: broadcast::Sender<ConnectivityEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectivityMonitor {
    /// Spawns the debounce task on the current runtime.
    ///
    /// Each settled offline-to-online transition sends one
    /// [`Trigger::ConnectivityRestored`] into `triggers`. The task stops when
    /// `cancel` fires or the monitor is shut down.
    pub fn spawn(
        config: MonitorConfig,
        triggers: Option<mpsc::Sender<Trigger>>,
        cancel: &CancellationToken,
    ) -> Self {
        let (raw, raw_rx) = watch::channel(config.initially_online);
        let (settled_tx, settled) = watch::channel(config.initially_online);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel = cancel.child_token();

        let task = tokio::spawn(debounce(
            raw_rx,
            settled_tx,
            events.clone(),
            triggers,
            config.settle_window,
            cancel.clone(),
        ));

        Self {
            raw,
            settled,
            events,
            cancel,
            task,
        }
    }

    /// Feeds a raw reachability observation.
    pub fn report(&self, online: bool) {
        self.raw.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    /// Returns the settled state.
    pub fn is_online(&self) -> bool {
        *self.settled.borrow()
    }

    /// Subscribes to settled transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    /// Returns a read-only view for the coordinator.
    pub fn status(&self) -> ConnectivityStatus {
        ConnectivityStatus {
            settled: self.settled.clone(),
        }
    }

    /// Stops the debounce task and waits for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(%err, "connectivity monitor task failed");
        }
    }
}

async fn debounce(
    mut raw: watch::Receiver<bool>,
    settled: watch::Sender<bool>,
    events: broadcast::Sender<ConnectivityEvent>,
    triggers: Option<mpsc::Sender<Trigger>>,
    window: Duration,
    cancel: CancellationToken,
) {
    loop {
        let target = *raw.borrow_and_update();

        if target == *settled.borrow() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = raw.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }
        }

        debug!(online = target, ?window, "connectivity change observed, settling");
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = raw.changed() => {
                if changed.is_err() {
                    return;
                }
                debug!("connectivity flapped before settling");
            }
            () = tokio::time::sleep(window) => {
                settled.send_replace(target);
                let event = if target {
                    ConnectivityEvent::WentOnline
                } else {
                    ConnectivityEvent::WentOffline
                };
                info!(?event, "connectivity settled");
                // No subscribers is fine.
                let _ = events.send(event);

                // Never dropped, even when the channel is full.
                if let (true, Some(triggers)) = (target, &triggers) {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = triggers.send(Trigger::ConnectivityRestored) => {
                            if sent.is_err() {
                                debug!("sync worker gone, trigger not delivered");
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn config() -> MonitorConfig {
        MonitorConfig::new().with_settle_window(Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn stable_change_settles_after_window() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let monitor = ConnectivityMonitor::spawn(config(), Some(tx), &cancel);
        let mut events = monitor.subscribe();

        monitor.report(true);
        sleep(Duration::from_millis(1_900)).await;
        assert!(!monitor.is_online());

        sleep(Duration::from_millis(200)).await;
        assert!(monitor.is_online());
        assert_eq!(events.try_recv().unwrap(), ConnectivityEvent::WentOnline);
        assert_eq!(rx.try_recv().unwrap(), Trigger::ConnectivityRestored);
        assert!(rx.try_recv().is_err());

        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn short_flaps_emit_nothing() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let monitor = ConnectivityMonitor::spawn(config(), Some(tx), &cancel);
        let mut events = monitor.subscribe();

        for _ in 0..5 {
            monitor.report(true);
            sleep(Duration::from_millis(500)).await;
            monitor.report(false);
            sleep(Duration::from_millis(500)).await;
        }
        sleep(Duration::from_secs(5)).await;

        assert!(!monitor.is_online());
        assert!(events.try_recv().is_err());
        assert!(rx.try_recv().is_err());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn flap_restarts_the_window() {
        let cancel = CancellationToken::new();
        let monitor = ConnectivityMonitor::spawn(config(), None, &cancel);
        let mut events = monitor.subscribe();

        monitor.report(true);
        sleep(Duration::from_millis(1_500)).await;
        monitor.report(false);
        sleep(Duration::from_millis(100)).await;
        monitor.report(true);
        sleep(Duration::from_millis(1_500)).await;
        assert!(!monitor.is_online());

        sleep(Duration::from_millis(600)).await;
        assert!(monitor.is_online());
        assert_eq!(events.try_recv().unwrap(), ConnectivityEvent::WentOnline);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_does_not_trigger_sync() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let monitor = ConnectivityMonitor::spawn(
            config().with_initially_online(true),
            Some(tx),
            &cancel,
        );
        let mut events = monitor.subscribe();
        let status = monitor.status();

        monitor.report(true);
        sleep(Duration::from_secs(3)).await;
        assert!(events.try_recv().is_err());

        monitor.report(false);
        sleep(Duration::from_secs(3)).await;
        assert!(!status.is_online());
        assert_eq!(events.try_recv().unwrap(), ConnectivityEvent::WentOffline);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn restoration_waits_for_room_in_a_full_channel() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(Trigger::LocalWrite).unwrap();
        let monitor = ConnectivityMonitor::spawn(config(), Some(tx), &cancel);

        monitor.report(true);
        sleep(Duration::from_secs(3)).await;
        assert!(monitor.is_online());

        assert_eq!(rx.recv().await, Some(Trigger::LocalWrite));
        assert_eq!(rx.recv().await, Some(Trigger::ConnectivityRestored));
        monitor.shutdown().await;
    }

    #[test]
    fn fixed_status() {
        assert!(ConnectivityStatus::always_online().is_online());
        assert!(!ConnectivityStatus::fixed(false).is_online());
    }
}

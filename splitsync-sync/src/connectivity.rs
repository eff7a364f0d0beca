//! Connectivity Monitor: decides when to drain.
//!
//! The platform reports reachability through [`ConnectivityHandle::set_online`].
//! While online the monitor drains on reconnect, on every poll tick with work
//! queued, when a write nudges it, and when a backoff deadline passes. While
//! offline it does nothing.

use crate::orchestrator::{DrainState, SyncOrchestrator};
use splitsync_types::now_millis;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Fire-and-forget drain request. Nudges made while no one is waiting are
/// remembered (at most one).
#[derive(Clone, Default)]
pub struct SyncTrigger {
    notify: Arc<Notify>,
}

impl SyncTrigger {
    pub fn nudge(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Shared online flag plus the drain trigger.
#[derive(Clone)]
pub struct ConnectivityHandle {
    online: Arc<watch::Sender<bool>>,
    trigger: SyncTrigger,
}

impl ConnectivityHandle {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self {
            online: Arc::new(tx),
            trigger: SyncTrigger::default(),
        }
    }

    /// Returns true if the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Asks for a drain soon. Ignored while offline.
    pub fn nudge(&self) {
        if self.is_online() {
            self.trigger.nudge();
        }
    }

    pub fn trigger(&self) -> &SyncTrigger {
        &self.trigger
    }
}

pub struct ConnectivityMonitor {
    orchestrator: Arc<SyncOrchestrator>,
    connectivity: ConnectivityHandle,
    poll_interval: Duration,
}

impl ConnectivityMonitor {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        connectivity: ConnectivityHandle,
        poll_interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            connectivity,
            poll_interval,
        }
    }

    /// Runs until `shutdown` flips or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("connectivity monitor started");
        let mut online_rx = self.connectivity.subscribe();
        let mut state_rx = self.orchestrator.subscribe_state();
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip first immediate tick
        poll.tick().await;

        if self.connectivity.is_online() {
            self.drain("startup").await;
        }

        loop {
            let backoff_until = match *state_rx.borrow_and_update() {
                DrainState::Backoff { until } => Some(until),
                _ => None,
            };
            let backoff = async move {
                if let Some(until) = backoff_until {
                    let wait = u64::try_from(until - now_millis()).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                }
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    info!(online, "connectivity changed");
                    if online {
                        self.drain("reconnected").await;
                    }
                }
                _ = poll.tick() => {
                    if self.connectivity.is_online() && self.has_work() {
                        self.drain("poll").await;
                    }
                }
                _ = self.connectivity.trigger().notified() => {
                    if self.connectivity.is_online() {
                        self.drain("nudge").await;
                    }
                }
                _ = backoff, if backoff_until.is_some() => {
                    if self.connectivity.is_online() {
                        self.drain("backoff elapsed").await;
                    }
                }
                // Re-read the backoff deadline.
                _ = state_rx.changed() => {}
            }
        }
        info!("connectivity monitor stopped");
    }

    fn has_work(&self) -> bool {
        match self.orchestrator.queue().pending_count() {
            Ok(n) => n > 0,
            Err(e) => {
                error!("reading queue length failed: {e}");
                false
            }
        }
    }

    async fn drain(&self, reason: &str) {
        debug!(reason, "drain triggered");
        if let Err(e) = self.orchestrator.drain().await {
            error!("drain failed: {e}");
        }
    }
}

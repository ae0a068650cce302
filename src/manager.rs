use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::MissedTickBehavior;

use crate::messages::{PresenceEvent, StateAnnouncement};
use crate::notifier::Notifier;
use crate::presence::{InvalidPersonError, PresenceTracker};
use crate::prober::Prober;
use crate::snapshot::{Snapshot, SnapshotStore};

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub concurrent_probes: bool,
}

pub struct Manager<P> {
    /// Person name -> address, iterated in name order every cycle.
    people: BTreeMap<String, String>,
    prober: P,
    tracker: PresenceTracker,
    notifier: Notifier,
    settings: LoopSettings,
    store: Option<SnapshotStore>,
}

impl<P: Prober> Manager<P> {
    pub fn new(
        people: BTreeMap<String, String>,
        prober: P,
        tracker: PresenceTracker,
        notifier: Notifier,
        settings: LoopSettings,
    ) -> Self {
        Manager {
            people,
            prober,
            tracker,
            notifier,
            settings,
            store: None,
        }
    }

    /// Persist the tracker after every cycle.
    pub fn with_snapshot_store(mut self, store: SnapshotStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn tracker(&self) -> &PresenceTracker {
        &self.tracker
    }

    async fn probe_all(&self) -> Vec<bool> {
        let timeout = self.settings.probe_timeout;
        if self.settings.concurrent_probes {
            join_all(
                self.people
                    .values()
                    .map(|address| self.prober.check(address, timeout)),
            )
            .await
        } else {
            let mut results = Vec::with_capacity(self.people.len());
            for address in self.people.values() {
                results.push(self.prober.check(address, timeout).await);
            }
            results
        }
    }

    /// Probe everyone, then fold the samples into the tracker one person at
    /// a time and deliver whatever events come out.
    pub async fn poll_cycle(
        &mut self,
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<PresenceEvent>, InvalidPersonError> {
        let samples = self.probe_all().await;

        if self.tracker.is_stale(now) {
            warn!(
                "Last cycle was at {:?}, too long ago; skipping presence changes this cycle",
                self.tracker.last_cycle_at().map(|t| t.to_rfc3339())
            );
        }

        let mut events = Vec::new();
        for (name, reachable) in self.people.keys().zip(samples) {
            info!("{} reachable: {}", name, reachable);
            if let Some(event) = self.tracker.update(name, reachable, now)? {
                info!(
                    "{} {} at {}",
                    event.person,
                    event.kind,
                    event.timestamp.to_rfc3339()
                );
                events.push(event);
            }
            debug!("{} is now {:?}", name, self.tracker.status(name)?);
        }
        self.tracker.finish_cycle(now);

        for event in &events {
            self.notifier.deliver(event).await;
        }

        if let Some(store) = &self.store {
            if let Err(err) = store.save(&self.tracker.snapshot(now)) {
                error!("Failed to save snapshot: {}", err);
            }
        }

        Ok(events)
    }

    /// Poll on a fixed period, and whenever a scan is requested, until
    /// `shutdown` resolves. A cycle already underway runs to completion.
    pub async fn run_loop(
        mut self,
        shutdown: impl Future<Output = ()>,
        mut scan_requests: Option<broadcast::Receiver<StateAnnouncement>>,
    ) -> Result<Snapshot, InvalidPersonError> {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Stopping poll loop");
                    break;
                }
                _ = interval.tick() => {
                    self.poll_cycle(Utc::now()).await?;
                }
                request = next_scan_request(&mut scan_requests) => {
                    debug!("Handling {:?}", request);
                    self.poll_cycle(Utc::now()).await?;
                    interval.reset();
                }
            }
        }

        Ok(self.tracker.snapshot(Utc::now()))
    }
}

/// Waits for the next scan request. Never resolves without a channel, or
/// once the channel has closed.
async fn next_scan_request(
    rx: &mut Option<broadcast::Receiver<StateAnnouncement>>,
) -> StateAnnouncement {
    loop {
        let Some(inner) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match inner.recv().await {
            Ok(msg) => return msg,
            Err(RecvError::Lagged(_)) => {
                debug!("Scan requests lagged");
                return StateAnnouncement::ScanRequested;
            }
            Err(RecvError::Closed) => {
                debug!("Scan request channel closed");
                *rx = None;
            }
        }
    }
}

//! Scheduler module for polling tracked devices.

use crate::db::Store;
use crate::presence::{PresenceState, Snapshot};
use crate::probe::Prober;
use crate::tracker::TrackedDevice;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;

/// Default polling period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Handle on a running poll loop.
struct PollTask {
    stop_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl PollTask {
    /// Signal the loop and wait for it to exit. A poll already in flight
    /// finishes its save first.
    async fn stop(self, id: &str) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.handle.await {
            tracing::error!("Poll loop for {} ended abnormally: {}", id, e);
        }
    }
}

/// Runs one poll loop per tracked device.
pub struct Scheduler {
    store: Arc<Store>,
    prober: Prober,
    interval: Duration,
    tasks: Arc<RwLock<HashMap<String, PollTask>>>,
}

impl Scheduler {
    /// Create a scheduler that polls every `interval` with `prober`, saving
    /// through `store`. No loops run until `add_device`.
    pub fn new(store: Arc<Store>, prober: Prober, interval: Duration) -> Self {
        Self {
            store,
            prober,
            interval,
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start polling a device. The first poll runs immediately.
    pub async fn add_device(
        &self,
        device: TrackedDevice,
        state: PresenceState,
        publisher: watch::Sender<Snapshot>,
    ) {
        let mut tasks = self.tasks.write().await;

        if tasks.contains_key(&device.id) {
            return; // Already running
        }

        tracing::info!(
            "Scheduler: polling {} every {:?} (timeout {:?})",
            device.name,
            self.interval,
            self.prober.timeout()
        );

        let id = device.id.clone();
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let poller = Poller {
            device,
            state,
            store: self.store.clone(),
            prober: self.prober.clone(),
            publisher,
        };
        let handle = tokio::spawn(poller.run(self.interval, stop_rx));
        tasks.insert(id, PollTask { stop_tx, handle });
    }

    /// Stop polling a device. Returns once its loop has exited, so nothing
    /// is written for `id` after this.
    pub async fn remove_device(&self, id: &str) {
        let task = self.tasks.write().await.remove(id);

        if let Some(task) = task {
            task.stop(id).await;
            tracing::info!("Scheduler: stopped polling {}", id);
        }
    }

    /// Stop every poll loop and wait for them to exit.
    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.tasks.write().await.drain().collect();
        for (id, task) in drained {
            task.stop(&id).await;
        }
    }

    #[cfg(test)]
    pub async fn is_polling(&self, id: &str) -> bool {
        self.tasks.read().await.contains_key(id)
    }
}

/// A single device's probe, fold, save, publish cycle.
struct Poller {
    device: TrackedDevice,
    state: PresenceState,
    store: Arc<Store>,
    prober: Prober,
    publisher: watch::Sender<Snapshot>,
}

impl Poller {
    async fn run(mut self, period: Duration, mut stop_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = interval.tick() => self.poll().await,
            }
        }
    }

    async fn poll(&mut self) {
        let observation = self.prober.probe(&self.device.target).await;
        self.state.observe(observation);

        tracing::debug!(
            "{}: online={} minutes_today={}",
            self.device.name,
            self.state.is_online,
            self.state.online_minutes
        );

        // In-memory state stays authoritative when the write fails
        if let Err(e) = self.store.save_state(&self.device.id, &self.state) {
            tracing::error!("Failed to save state for {}: {}", self.device.name, e);
        }

        self.publisher.send_replace(self.state.snapshot());
    }
}

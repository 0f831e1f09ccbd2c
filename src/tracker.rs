//! Device setup and the registry of tracked devices.
//!
//! [`Tracker`] is the integration layer the rest of the process talks to:
//! it validates device configurations, persists them, restores presence
//! state and hands devices to the [`Scheduler`]. The [`Registry`] it owns
//! holds each tracked device together with its latest published snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Local;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};

use crate::db::{DbError, DeviceRecord, Store};
use crate::presence::{PresenceState, Snapshot};
use crate::probe::{ProbeError, Target};
use crate::scheduler::Scheduler;

/// Device setup errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("device name is empty")]
    EmptyName,
    #[error("invalid target: {0}")]
    InvalidTarget(#[from] ProbeError),
    #[error("a device named {0:?} is already configured")]
    DuplicateName(String),
    #[error("target {0} is already tracked by device {1:?}")]
    DuplicateTarget(String, String),
    #[error("unknown device {0:?}")]
    UnknownDevice(String),
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

/// A configured device. Immutable once set up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedDevice {
    pub id: String,
    pub name: String,
    pub target: Target,
}

impl TrackedDevice {
    pub fn new(name: &str, target: &str) -> Result<Self, ConfigError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::EmptyName);
        }

        Ok(Self {
            id: device_id(name),
            name: name.to_string(),
            target: target.parse()?,
        })
    }

    fn to_record(&self) -> DeviceRecord {
        DeviceRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            target: self.target.to_string(),
        }
    }
}

impl TryFrom<DeviceRecord> for TrackedDevice {
    type Error = ConfigError;

    fn try_from(record: DeviceRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: record.id,
            name: record.name,
            target: record.target.parse()?,
        })
    }
}

/// Stable id derived from the display name: "Living Room TV" -> "living_room_tv".
pub fn device_id(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                '_'
            }
        })
        .collect()
}

/// A device and what is currently known about it.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub device: TrackedDevice,
    #[serde(flatten)]
    pub snapshot: Snapshot,
}

struct Entry {
    device: TrackedDevice,
    snapshot: watch::Receiver<Snapshot>,
}

/// All devices currently being tracked, keyed by device id.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and return the handle its poll loop publishes through.
    pub async fn register(&self, device: TrackedDevice, initial: Snapshot) -> watch::Sender<Snapshot> {
        let (tx, rx) = watch::channel(initial);
        let mut entries = self.entries.write().await;
        entries.insert(
            device.id.clone(),
            Entry {
                device,
                snapshot: rx,
            },
        );
        tx
    }

    /// Drop a device from the registry, returning it if it was tracked.
    pub async fn unregister(&self, id: &str) -> Option<TrackedDevice> {
        self.entries.write().await.remove(id).map(|e| e.device)
    }

    /// The device and its latest snapshot.
    pub async fn get(&self, id: &str) -> Option<DeviceView> {
        let entries = self.entries.read().await;
        entries.get(id).map(Entry::view)
    }

    #[cfg(test)]
    pub async fn snapshot(&self, id: &str) -> Option<Snapshot> {
        let entries = self.entries.read().await;
        entries.get(id).map(|e| *e.snapshot.borrow())
    }

    /// Devices sorted by id.
    pub async fn list(&self) -> Vec<DeviceView> {
        let entries = self.entries.read().await;
        let mut views: Vec<_> = entries.values().map(Entry::view).collect();
        views.sort_by(|a, b| a.device.id.cmp(&b.device.id));
        views
    }

    /// Reject a device clashing with one already tracked.
    pub async fn check_unique(&self, device: &TrackedDevice) -> Result<(), ConfigError> {
        let entries = self.entries.read().await;
        if entries.contains_key(&device.id) {
            return Err(ConfigError::DuplicateName(device.name.clone()));
        }
        if let Some(other) = entries.values().find(|e| e.device.target == device.target) {
            return Err(ConfigError::DuplicateTarget(
                device.target.to_string(),
                other.device.name.clone(),
            ));
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Entry {
    fn view(&self) -> DeviceView {
        DeviceView {
            device: self.device.clone(),
            snapshot: *self.snapshot.borrow(),
        }
    }
}

/// Sets devices up and tears them down.
pub struct Tracker {
    store: Arc<Store>,
    registry: Arc<Registry>,
    scheduler: Arc<Scheduler>,
    setup_lock: Mutex<()>,
}

impl Tracker {
    pub fn new(store: Arc<Store>, registry: Arc<Registry>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            store,
            registry,
            scheduler,
            setup_lock: Mutex::new(()),
        }
    }

    /// The registry of tracked devices, for read access.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Resume tracking every device found in the database.
    ///
    /// Broken entries are logged and skipped. Presence rows of devices that
    /// are no longer configured are pruned first.
    pub async fn resume(&self) -> Result<usize, ConfigError> {
        match self.store.prune_orphaned_presence() {
            Ok(0) => {}
            Ok(n) => tracing::info!("Pruned {} orphaned presence records", n),
            Err(e) => tracing::warn!("Failed to prune orphaned presence records: {}", e),
        }

        let records = self.store.get_devices()?;
        let mut started = 0;

        for record in records {
            let id = record.id.clone();
            let device = match TrackedDevice::try_from(record) {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!("Skipping stored device {}: {}", id, e);
                    continue;
                }
            };

            let _guard = self.setup_lock.lock().await;
            if let Err(e) = self.registry.check_unique(&device).await {
                tracing::error!("Skipping stored device {}: {}", id, e);
                continue;
            }
            self.start(device).await;
            started += 1;
        }

        tracing::info!("Resumed tracking of {} devices", started);
        Ok(started)
    }

    /// Configure a new device and start tracking it.
    pub async fn setup(&self, name: &str, target: &str) -> Result<TrackedDevice, ConfigError> {
        let device = TrackedDevice::new(name, target)?;

        let _guard = self.setup_lock.lock().await;
        self.registry.check_unique(&device).await?;
        self.store.add_device(&device.to_record())?;

        tracing::info!("Set up device {} ({}) -> {}", device.name, device.id, device.target);
        self.start(device.clone()).await;
        Ok(device)
    }

    /// Stop tracking a device and forget its configuration.
    pub async fn remove(&self, id: &str) -> Result<TrackedDevice, ConfigError> {
        let _guard = self.setup_lock.lock().await;
        let device = self
            .registry
            .unregister(id)
            .await
            .ok_or_else(|| ConfigError::UnknownDevice(id.to_string()))?;

        self.scheduler.remove_device(id).await;
        match self.store.delete_device(id) {
            Ok(()) | Err(DbError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!("Removed device {} ({})", device.name, device.id);
        Ok(device)
    }

    async fn start(&self, device: TrackedDevice) {
        let today = Local::now().date_naive();
        let stored = match self.store.load_state(&device.id) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!("Failed to load state for {}, starting fresh: {}", device.id, e);
                None
            }
        };

        let state = PresenceState::restore(stored, today);
        let publisher = self.registry.register(device.clone(), state.snapshot()).await;
        self.scheduler.add_device(device, state, publisher).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PresenceRecord;
    use crate::probe::Prober;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn tracker(path: &std::path::Path) -> Tracker {
        let store = Arc::new(Store::new(path).unwrap());
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            Prober::new(Duration::from_millis(100)),
            Duration::from_secs(3600),
        ));
        Tracker::new(store, Arc::new(Registry::new()), scheduler)
    }

    #[test]
    fn test_device_id() {
        assert_eq!(device_id("Living Room TV"), "living_room_tv");
        assert_eq!(device_id("  NAS-01 "), "nas-01");
        assert_eq!(device_id("a/b"), "a_b");
    }

    #[test]
    fn test_tracked_device_validation() {
        assert!(matches!(
            TrackedDevice::new("  ", "192.168.1.2"),
            Err(ConfigError::EmptyName)
        ));
        assert!(matches!(
            TrackedDevice::new("Phone", ""),
            Err(ConfigError::InvalidTarget(_))
        ));
        assert!(matches!(
            TrackedDevice::new("Phone", "aa:bb:cc"),
            Err(ConfigError::InvalidTarget(_))
        ));

        let device = TrackedDevice::new("My Phone", "AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(device.id, "my_phone");
        assert_eq!(device.target.to_string(), "aa:bb:cc:dd:ee:ff");
    }

    #[tokio::test]
    async fn test_registry_publishes_snapshots() {
        let registry = Registry::new();
        let device = TrackedDevice::new("NAS", "192.0.2.10").unwrap();

        let tx = registry.register(device, Snapshot::default()).await;
        assert_eq!(registry.snapshot("nas").await, Some(Snapshot::default()));

        tx.send_replace(Snapshot {
            is_online: true,
            online_minutes: 3,
            last_checked_at: None,
        });
        let view = registry.get("nas").await.unwrap();
        assert!(view.snapshot.is_online);
        assert_eq!(view.snapshot.online_minutes, 3);

        assert!(registry.unregister("nas").await.is_some());
        assert!(registry.snapshot("nas").await.is_none());
    }

    #[tokio::test]
    async fn test_setup_rejects_duplicates() {
        let tmp = NamedTempFile::new().unwrap();
        let tracker = tracker(tmp.path());

        tracker.setup("Printer", "192.0.2.20").await.unwrap();

        assert!(matches!(
            tracker.setup("printer", "192.0.2.21").await,
            Err(ConfigError::DuplicateName(_))
        ));
        assert!(matches!(
            tracker.setup("Other", " 192.0.2.20 ").await,
            Err(ConfigError::DuplicateTarget(_, _))
        ));
        assert_eq!(tracker.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_and_resume() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let tracker = tracker(tmp.path());
            tracker.setup("Printer", "192.0.2.20").await.unwrap();
            tracker.setup("Phone", "02:00:00:00:00:01").await.unwrap();
            tracker.remove("printer").await.unwrap();
            assert!(matches!(
                tracker.remove("printer").await,
                Err(ConfigError::UnknownDevice(_))
            ));
        }

        let tracker = tracker(tmp.path());
        assert_eq!(tracker.resume().await.unwrap(), 1);
        let devices = tracker.registry().list().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device.id, "phone");
    }

    #[tokio::test]
    async fn test_start_restores_same_day_state() {
        let tmp = NamedTempFile::new().unwrap();
        let tracker = tracker(tmp.path());

        let today = Local::now().date_naive();
        let stored = PresenceState {
            is_online: false,
            last_checked_at: None,
            online_minutes: 55,
            current_day: today,
        };
        tracker.store.save_state("printer", &stored).unwrap();
        tracker
            .store
            .add_device(&TrackedDevice::new("Printer", "192.0.2.20").unwrap().to_record())
            .unwrap();

        tracker.resume().await.unwrap();
        let snap = tracker.registry().snapshot("printer").await.unwrap();
        assert_eq!(snap.online_minutes, 55);
    }

    #[tokio::test]
    async fn test_corrupt_presence_starts_fresh() {
        let tmp = NamedTempFile::new().unwrap();
        let tracker = tracker(tmp.path());

        tracker
            .store
            .add_device(&TrackedDevice::new("Printer", "192.0.2.20").unwrap().to_record())
            .unwrap();
        let corrupt = PresenceRecord {
            online_time: 30,
            last_date: "yesterday".to_string(),
            is_online: true,
            last_check: None,
        };
        tracker.store.save_presence("printer", &corrupt).unwrap();

        assert_eq!(tracker.resume().await.unwrap(), 1);
        let snap = tracker.registry().snapshot("printer").await.unwrap();
        assert_eq!(snap.online_minutes, 0);
        assert!(!snap.is_online);
    }

    #[tokio::test]
    async fn test_remove_then_setup_again() {
        let tmp = NamedTempFile::new().unwrap();
        let tracker = tracker(tmp.path());

        tracker.setup("Printer", "192.0.2.20").await.unwrap();
        tracker.remove("printer").await.unwrap();
        assert!(!tracker.scheduler.is_polling("printer").await);

        tracker.setup("Printer", "192.0.2.20").await.unwrap();
        assert!(tracker.scheduler.is_polling("printer").await);
        assert_eq!(tracker.registry().len().await, 1);
        assert_eq!(tracker.store.get_devices().unwrap().len(), 1);

        tracker.scheduler.stop_all().await;
    }
}

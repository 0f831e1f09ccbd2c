//! Presentation adapters over a device [`Snapshot`].
//!
//! Each adapter turns the snapshot into one displayable value; neither
//! knows about the other.

use serde::Serialize;

use crate::presence::Snapshot;
use crate::tracker::TrackedDevice;

/// Connectivity flag: on while the device answers probes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReading {
    pub unique_id: String,
    pub name: String,
    pub device_class: &'static str,
    pub is_on: bool,
    pub state: &'static str,
}

impl StatusReading {
    pub fn new(device: &TrackedDevice, snapshot: &Snapshot) -> Self {
        Self {
            unique_id: format!("{}_status", device.id),
            name: format!("{} Status", device.name),
            device_class: "connectivity",
            is_on: snapshot.is_online,
            state: if snapshot.is_online { "on" } else { "off" },
        }
    }
}

/// Online time accumulated today, in minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnlineTimeReading {
    pub unique_id: String,
    pub name: String,
    pub device_class: &'static str,
    pub value: u64,
    pub unit: &'static str,
}

impl OnlineTimeReading {
    pub fn new(device: &TrackedDevice, snapshot: &Snapshot) -> Self {
        Self {
            unique_id: format!("{}_online_time", device.id),
            name: format!("{} Online Time", device.name),
            device_class: "duration",
            value: snapshot.online_minutes,
            unit: "min",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readings() {
        let device = TrackedDevice::new("Phone", "192.0.2.7").unwrap();
        let snapshot = Snapshot {
            is_online: true,
            online_minutes: 125,
            last_checked_at: None,
        };

        let status = StatusReading::new(&device, &snapshot);
        assert_eq!(status.unique_id, "phone_status");
        assert!(status.is_on);
        assert_eq!(status.state, "on");

        let time = OnlineTimeReading::new(&device, &snapshot);
        assert_eq!(time.unique_id, "phone_online_time");
        assert_eq!(time.value, 125);
        assert_eq!(time.unit, "min");

        let offline = StatusReading::new(&device, &Snapshot::default());
        assert_eq!(offline.state, "off");
    }
}

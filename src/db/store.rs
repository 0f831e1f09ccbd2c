//! SQLite database store implementation.

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::presence::PresenceState;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("Connection lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
///
/// Every statement runs under one connection mutex, so concurrent saves
/// from different device loops are serialized.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Break the presence table so writes fail.
    #[cfg(test)]
    pub fn drop_presence_table(&self) -> Result<(), DbError> {
        self.conn()?.execute_batch("DROP TABLE presence")?;
        Ok(())
    }

    // --- Devices ---

    /// Insert a device configuration. Fails on a duplicate id or target.
    pub fn add_device(&self, device: &DeviceRecord) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO devices (id, name, target) VALUES (?1, ?2, ?3)",
            params![device.id, device.name, device.target],
        )?;
        Ok(())
    }

    /// All configured devices, ordered by id.
    pub fn get_devices(&self) -> Result<Vec<DeviceRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, target FROM devices ORDER BY id")?;

        let devices = stmt
            .query_map([], |row| {
                Ok(DeviceRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    target: row.get(2)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(devices)
    }

    /// Remove a device configuration. Its presence row is left behind
    /// until [`Store::prune_orphaned_presence`] runs.
    pub fn delete_device(&self, id: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM devices WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Presence ---

    /// The raw presence row for a device, if one was ever saved.
    pub fn load_presence(&self, device_id: &str) -> Result<Option<PresenceRecord>, DbError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT online_time, last_date, is_online, last_check FROM presence WHERE device_id = ?1",
                params![device_id],
                |row| {
                    Ok(PresenceRecord {
                        online_time: row.get(0)?,
                        last_date: row.get(1)?,
                        is_online: row.get(2)?,
                        last_check: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Replace the whole presence row for a device.
    pub fn save_presence(&self, device_id: &str, record: &PresenceRecord) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO presence (device_id, online_time, last_date, is_online, last_check)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(device_id) DO UPDATE SET
             online_time=excluded.online_time, last_date=excluded.last_date,
             is_online=excluded.is_online, last_check=excluded.last_check",
            params![
                device_id,
                record.online_time,
                record.last_date,
                record.is_online,
                record.last_check,
            ],
        )?;
        Ok(())
    }

    /// Load and decode a device's accumulator state.
    pub fn load_state(&self, device_id: &str) -> Result<Option<PresenceState>, DbError> {
        self.load_presence(device_id)?
            .map(PresenceState::try_from)
            .transpose()
    }

    pub fn save_state(&self, device_id: &str, state: &PresenceState) -> Result<(), DbError> {
        self.save_presence(device_id, &PresenceRecord::from(state))
    }

    /// Delete presence rows whose device is no longer configured.
    pub fn prune_orphaned_presence(&self) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let pruned = conn.execute(
            "DELETE FROM presence WHERE device_id NOT IN (SELECT id FROM devices)",
            [],
        )?;
        Ok(pruned)
    }
}

impl From<&PresenceState> for PresenceRecord {
    fn from(state: &PresenceState) -> Self {
        Self {
            online_time: state.online_minutes as i64,
            last_date: state.current_day.format(DATE_FORMAT).to_string(),
            is_online: state.is_online,
            last_check: state
                .last_checked_at
                .map(|t| t.format(TIMESTAMP_FORMAT).to_string()),
        }
    }
}

impl TryFrom<PresenceRecord> for PresenceState {
    type Error = DbError;

    fn try_from(record: PresenceRecord) -> Result<Self, Self::Error> {
        let current_day = NaiveDate::parse_from_str(&record.last_date, DATE_FORMAT)
            .map_err(|e| DbError::Corrupt(format!("last_date {:?}: {}", record.last_date, e)))?;

        let last_checked_at = match record.last_check.as_deref() {
            Some(s) => Some(
                parse_timestamp(s)
                    .ok_or_else(|| DbError::Corrupt(format!("last_check {:?}", s)))?,
            ),
            None => None,
        };

        if record.online_time < 0 {
            return Err(DbError::Corrupt(format!(
                "negative online_time {}",
                record.online_time
            )));
        }

        Ok(Self {
            is_online: record.is_online,
            last_checked_at,
            online_minutes: record.online_time as u64,
            current_day,
        })
    }
}

/// Parse a local timestamp as written by this store or by hand.
fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let formats = [
        TIMESTAMP_FORMAT,
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    formats
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn device(id: &str, target: &str) -> DeviceRecord {
        DeviceRecord {
            id: id.to_string(),
            name: id.to_string(),
            target: target.to_string(),
        }
    }

    fn sample_state() -> PresenceState {
        PresenceState {
            is_online: true,
            last_checked_at: NaiveDateTime::parse_from_str(
                "2024-05-01T13:45:10.250",
                TIMESTAMP_FORMAT,
            )
            .ok(),
            online_minutes: 87,
            current_day: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        }
    }

    #[test]
    fn test_device_crud() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        store.add_device(&device("phone", "aa:bb:cc:dd:ee:ff")).unwrap();
        store.add_device(&device("nas", "192.168.1.5")).unwrap();

        let devices = store.get_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "nas");

        // Same target twice violates the UNIQUE constraint
        assert!(store.add_device(&device("nas2", "192.168.1.5")).is_err());

        store.delete_device("nas").unwrap();
        assert_eq!(store.get_devices().unwrap().len(), 1);
        assert!(matches!(store.delete_device("nas"), Err(DbError::NotFound)));
    }

    #[test]
    fn test_state_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        assert_eq!(store.load_state("phone").unwrap(), None);

        let state = sample_state();
        store.save_state("phone", &state).unwrap();
        assert_eq!(store.load_state("phone").unwrap(), Some(state.clone()));

        // Whole-record replacement
        let mut next = state;
        next.is_online = false;
        next.last_checked_at = None;
        store.save_state("phone", &next).unwrap();
        assert_eq!(store.load_state("phone").unwrap(), Some(next));
    }

    #[test]
    fn test_state_survives_reopen() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = Store::new(tmp.path()).unwrap();
            store.save_state("phone", &sample_state()).unwrap();
        }
        let store = Store::new(tmp.path()).unwrap();
        assert_eq!(store.load_state("phone").unwrap(), Some(sample_state()));
    }

    #[test]
    fn test_record_layout() {
        let record = PresenceRecord::from(&sample_state());
        assert_eq!(record.online_time, 87);
        assert_eq!(record.last_date, "2024-05-01");
        assert!(record.is_online);
        assert_eq!(record.last_check.as_deref(), Some("2024-05-01T13:45:10.250"));
    }

    #[test]
    fn test_corrupt_record() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        store
            .save_presence(
                "phone",
                &PresenceRecord {
                    online_time: 5,
                    last_date: "yesterday".to_string(),
                    is_online: false,
                    last_check: None,
                },
            )
            .unwrap();
        assert!(matches!(store.load_state("phone"), Err(DbError::Corrupt(_))));

        store
            .save_presence(
                "phone",
                &PresenceRecord {
                    online_time: 5,
                    last_date: "2024-05-01".to_string(),
                    is_online: true,
                    last_check: Some("2024-05-01 09:30:00".to_string()),
                },
            )
            .unwrap();
        let state = store.load_state("phone").unwrap().unwrap();
        assert_eq!(
            state.last_checked_at,
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(9, 30, 0)
        );
    }

    #[test]
    fn test_prune_orphaned_presence() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        store.add_device(&device("phone", "aa:bb:cc:dd:ee:ff")).unwrap();
        store.save_state("phone", &sample_state()).unwrap();
        store.save_state("gone", &sample_state()).unwrap();

        assert_eq!(store.prune_orphaned_presence().unwrap(), 1);
        assert!(store.load_state("gone").unwrap().is_none());
        assert!(store.load_state("phone").unwrap().is_some());
    }
}

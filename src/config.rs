//! Configuration module.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

use crate::probe::DEFAULT_PROBE_TIMEOUT;
use crate::scheduler::DEFAULT_POLL_INTERVAL;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "online_tracker.db")
    pub db_path: String,
    /// Time between two probes of the same device (default: 60s)
    pub poll_interval: Duration,
    /// Echo reply timeout (default: 2s)
    pub probe_timeout: Duration,
    /// Devices to set up at start, as (name, target) pairs
    pub seed_devices: Vec<(String, String)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "online_tracker.db".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            seed_devices: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TRACKER_HTTP_PORT`: HTTP port (default: 8080)
    /// - `TRACKER_DB_PATH`: Database file path (default: "online_tracker.db")
    /// - `TRACKER_POLL_INTERVAL`: Seconds between probes (default: 60)
    /// - `TRACKER_PROBE_TIMEOUT`: Probe timeout in seconds (default: 2)
    /// - `TRACKER_DEVICES`: Devices to seed, e.g. `Phone=aa:bb:cc:dd:ee:ff,NAS=192.168.1.5`
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = lookup("TRACKER_HTTP_PORT").and_then(|s| s.parse().ok()) {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("TRACKER_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(secs) = lookup("TRACKER_POLL_INTERVAL").and_then(|s| parse_secs(&s)) {
            cfg.poll_interval = secs;
        }

        if let Some(secs) = lookup("TRACKER_PROBE_TIMEOUT").and_then(|s| parse_secs(&s)) {
            cfg.probe_timeout = secs;
        }

        if let Some(devices) = lookup("TRACKER_DEVICES") {
            cfg.seed_devices = parse_device_list(&devices);
        }

        cfg
    }
}

/// Positive, finite seconds.
fn parse_secs(s: &str) -> Option<Duration> {
    let secs: f64 = s.trim().parse().ok()?;
    if secs.is_finite() && secs > 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// Parse `Name=target,Name=target`. Entries without `=` are skipped.
fn parse_device_list(s: &str) -> Vec<(String, String)> {
    s.split(',')
        .filter_map(|entry| {
            let (name, target) = entry.split_once('=')?;
            let (name, target) = (name.trim(), target.trim());
            if name.is_empty() || target.is_empty() {
                tracing::warn!("Ignoring malformed device entry {:?}", entry);
                return None;
            }
            Some((name.to_string(), target.to_string()))
        })
        .collect()
}

//! Reachability probing for tracked devices.
//!
//! A probe never fails: every resolution or network error is logged and
//! reported as "offline".

mod neighbor;
mod ping;
mod target;

pub use neighbor::*;
pub use ping::*;
pub use target::*;

use std::net::IpAddr;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use thiserror::Error;

/// Default echo timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Allowance on top of the echo timeout for neighbor-table reads and DNS.
const RESOLUTION_ALLOWANCE: Duration = Duration::from_secs(3);

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("address resolution failed: {0}")]
    Resolution(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// The outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub is_online: bool,
    /// Local wall-clock time at which the probe started.
    pub checked_at: NaiveDateTime,
}

/// Runs one reachability check per call, no retries.
#[derive(Debug, Clone)]
pub struct Prober {
    timeout: Duration,
}

impl Default for Prober {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl Prober {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe `target` once. Always returns a definite status.
    pub async fn probe(&self, target: &Target) -> Observation {
        let checked_at = Local::now().naive_local();
        let bound = self.timeout + RESOLUTION_ALLOWANCE;

        let is_online = match tokio::time::timeout(bound, self.check(target)).await {
            Ok(Ok(rtt)) => {
                tracing::debug!("{} is online (rtt {:?})", target, rtt);
                true
            }
            Ok(Err(ProbeError::Timeout(_))) => {
                tracing::debug!("{} is offline (no reply)", target);
                false
            }
            Ok(Err(e)) => {
                tracing::debug!("{} is offline: {}", target, e);
                false
            }
            Err(_) => {
                tracing::warn!("Probe of {} exceeded {:?}, treating as offline", target, bound);
                false
            }
        };

        Observation {
            is_online,
            checked_at,
        }
    }

    async fn check(&self, target: &Target) -> Result<Duration, ProbeError> {
        match target {
            Target::Ip(ip) => ping(*ip, self.timeout).await,
            Target::Host(host) => {
                let ip = resolve_host(host).await?;
                ping(ip, self.timeout).await
            }
            Target::Mac(mac) => match resolve_mac(*mac).await {
                Ok(ip) => {
                    tracing::debug!("Resolved {} to {}", mac, ip);
                    ping(ip, self.timeout).await
                }
                Err(e) => {
                    tracing::warn!("{}, trying ping against the MAC literal", e);
                    ping_command(&mac.to_string(), self.timeout).await
                }
            },
        }
    }
}

async fn resolve_host(host: &str) -> Result<IpAddr, ProbeError> {
    tokio::net::lookup_host(format!("{}:0", host))
        .await
        .map_err(|e| ProbeError::Resolution(format!("DNS lookup of {} failed: {}", host, e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Resolution(format!("no addresses found for {}", host)))
}

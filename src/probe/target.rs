//! Probe targets: IP literals, MAC addresses and host names.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use super::ProbeError;

/// A 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    #[cfg(test)]
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl FromStr for MacAddr {
    type Err = ProbeError;

    /// Accepts six hex byte pairs separated by `:` or `-`, in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProbeError::Config(format!("invalid MAC address: {}", s));

        let sep = if s.contains(':') { ':' } else { '-' };
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(sep);

        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }

        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// What a tracked device is probed by. Parsed once at setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Ip(IpAddr),
    Mac(MacAddr),
    /// A DNS name, resolved at probe time.
    Host(String),
}

impl FromStr for Target {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ProbeError::Config("target is empty".to_string()));
        }

        // IPv6 literals contain ':' too, so IP parsing goes first
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Target::Ip(ip));
        }

        if s.contains(':') || s.matches('-').count() == 5 {
            if let Ok(mac) = s.parse::<MacAddr>() {
                return Ok(Target::Mac(mac));
            }
        }

        if is_valid_hostname(s) {
            return Ok(Target::Host(s.to_ascii_lowercase()));
        }

        Err(ProbeError::Config(format!(
            "target is neither an IP address, a MAC address nor a host name: {}",
            s
        )))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Ip(ip) => write!(f, "{}", ip),
            Target::Mac(mac) => write!(f, "{}", mac),
            Target::Host(host) => f.write_str(host),
        }
    }
}

impl Serialize for Target {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// RFC 1123 host name check.
fn is_valid_hostname(s: &str) -> bool {
    if s.len() > 253 {
        return false;
    }
    let s = s.strip_suffix('.').unwrap_or(s);

    !s.is_empty()
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

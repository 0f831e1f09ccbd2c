//! MAC to IP resolution through the local neighbor table (ARP/NDP cache).

use std::net::IpAddr;
use std::process::Stdio;

use tokio::process::Command;

use super::{MacAddr, ProbeError};

const PROC_NET_ARP: &str = "/proc/net/arp";

/// Resolve a hardware address to the IP the kernel currently associates with it.
///
/// Reads `ip neigh show` and falls back to `/proc/net/arp` when the `ip`
/// tool is missing. IPv4 entries win over IPv6 ones.
pub async fn resolve_mac(mac: MacAddr) -> Result<IpAddr, ProbeError> {
    let entries = match read_ip_neigh().await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("ip neigh unavailable ({}), reading {}", e, PROC_NET_ARP);
            read_proc_arp().await?
        }
    };

    find_ip(&entries, mac)
        .ok_or_else(|| ProbeError::Resolution(format!("no neighbor entry for {}", mac)))
}

async fn read_ip_neigh() -> Result<Vec<(IpAddr, MacAddr)>, ProbeError> {
    let output = Command::new("ip")
        .args(["neigh", "show"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ip neigh: {}", e)))?;

    if !output.status.success() {
        return Err(ProbeError::Command(format!(
            "ip neigh failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(parse_ip_neigh(&String::from_utf8_lossy(&output.stdout)))
}

async fn read_proc_arp() -> Result<Vec<(IpAddr, MacAddr)>, ProbeError> {
    let contents = tokio::fs::read_to_string(PROC_NET_ARP)
        .await
        .map_err(|e| ProbeError::Resolution(format!("failed to read {}: {}", PROC_NET_ARP, e)))?;
    Ok(parse_proc_arp(&contents))
}

/// Parse `ip neigh show` lines such as
/// `192.168.1.10 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE`.
fn parse_ip_neigh(output: &str) -> Vec<(IpAddr, MacAddr)> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let ip = fields.next()?.parse::<IpAddr>().ok()?;
            // INCOMPLETE and FAILED entries carry no lladdr
            fields.by_ref().find(|f| *f == "lladdr")?;
            let mac = fields.next()?.parse::<MacAddr>().ok()?;
            Some((ip, mac))
        })
        .collect()
}

/// Parse `/proc/net/arp`:
/// `IP address  HW type  Flags  HW address  Mask  Device`.
fn parse_proc_arp(contents: &str) -> Vec<(IpAddr, MacAddr)> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 || fields[2] == "0x0" {
                return None;
            }
            let ip = fields[0].parse::<IpAddr>().ok()?;
            let mac = fields[3].parse::<MacAddr>().ok()?;
            Some((ip, mac))
        })
        .collect()
}

fn find_ip(entries: &[(IpAddr, MacAddr)], mac: MacAddr) -> Option<IpAddr> {
    let mut matches = entries.iter().filter(|(_, m)| *m == mac).map(|(ip, _)| *ip);
    let first = matches.next()?;
    if first.is_ipv4() {
        return Some(first);
    }
    Some(matches.find(IpAddr::is_ipv4).unwrap_or(first))
}

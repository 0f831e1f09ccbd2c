//! ICMP echo with native sockets and a `ping` command fallback.
//!
//! Native probes use blocking sockets inside spawn_blocking.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Identifier/sequence pair so concurrent echoes to one host stay distinguishable.
fn next_echo_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping: using native ICMP (RAW socket)");
        return IcmpCapability::Native;
    }

    // Unprivileged on Linux when ping_group_range allows it, and on macOS
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping: using native ICMP (DGRAM socket)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping: native ICMP unavailable, using ping command");
    IcmpCapability::CommandOnly
}

/// Send a single echo request to `ip` and wait up to `timeout` for the reply.
///
/// Returns the round-trip time.
pub async fn ping(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        let result = tokio::task::spawn_blocking(move || blocking_echo(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Err(ProbeError::PermissionDenied(msg)) => {
                tracing::warn!(
                    "Native ping to {} not permitted ({}), falling back to command",
                    ip,
                    msg
                );
            }
            other => return other,
        }
    }

    ping_command(&ip.to_string(), timeout).await
}

fn blocking_echo(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, ICMP_ECHO_REQUEST, ICMP_ECHO_REPLY),
        IpAddr::V6(_) => (
            Domain::IPV6,
            Protocol::ICMPV6,
            ICMPV6_ECHO_REQUEST,
            ICMPV6_ECHO_REPLY,
        ),
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| socket_error("create ICMP socket", e))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| socket_error("set timeout", e))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| socket_error("set timeout", e))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| socket_error("connect", e))?;

    let (identifier, sequence) = next_echo_id();
    let packet = build_echo_request(request_type, identifier, sequence, ip.is_ipv4());

    let start = Instant::now();
    socket.send(&packet).map_err(|e| socket_error("send", e))?;

    loop {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ProbeError::Timeout(timeout)
            }
            _ => socket_error("receive", e),
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if is_matching_reply(buf, reply_type, identifier, sequence) {
            return Ok(elapsed);
        }
        // Someone else's packet, keep waiting
    }
}

fn socket_error(op: &str, e: std::io::Error) -> ProbeError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        ProbeError::PermissionDenied(format!("{}: {}", op, e))
    } else {
        ProbeError::Network(format!("failed to {}: {}", op, e))
    }
}

/// Check an incoming datagram against the echo we sent.
///
/// RAW IPv4 sockets deliver the IP header in front of the ICMP message,
/// DGRAM and IPv6 sockets do not.
fn is_matching_reply(buf: &[u8], reply_type: u8, identifier: u16, sequence: u16) -> bool {
    let offset = if reply_type == ICMP_ECHO_REPLY && !buf.is_empty() && buf[0] >> 4 == 4 {
        ((buf[0] & 0x0f) as usize) * 4
    } else {
        0
    };

    if buf.len() < offset + 8 {
        return false;
    }

    let icmp = &buf[offset..];
    icmp[0] == reply_type
        && u16::from_be_bytes([icmp[4], icmp[5]]) == identifier
        && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

/// Build an echo request: 8 byte header and 56 byte payload.
///
/// The ICMPv6 checksum covers a pseudo-header and is filled in by the kernel.
fn build_echo_request(request_type: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = request_type;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    if with_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// RFC 1071 checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Ping through the system `ping` binary.
///
/// `address` is passed verbatim, which is also how a MAC literal is tried
/// when the neighbor table has no entry for it.
pub async fn ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!(
            "ping {} failed: {}",
            address,
            stderr.trim()
        )));
    }

    // A zero exit status already means a reply came back
    Ok(parse_round_trip(&stdout).unwrap_or_default())
}

/// Pull the round-trip time out of `ping` output.
fn parse_round_trip(output: &str) -> Option<Duration> {
    // "time=12.3 ms" per reply, or the "min/avg/max" summary line (Linux rtt, macOS round-trip)
    static PER_REPLY: OnceLock<Regex> = OnceLock::new();
    static SUMMARY: OnceLock<Regex> = OnceLock::new();

    let per_reply = PER_REPLY.get_or_init(|| {
        Regex::new(r"time[=<](?P<ms>[0-9.]+)\s*ms").expect("static regex")
    });
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/")
            .expect("static regex")
    });

    per_reply
        .captures(output)
        .or_else(|| summary.captures(output))
        .and_then(|caps| caps.name("ms"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|ms| Duration::from_nanos((ms * 1_000_000.0).round() as u64))
}

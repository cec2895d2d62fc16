//! Ping probe: native ICMP echo with a `ping` command fallback.
//!
//! Native echo runs on a blocking socket inside `spawn_blocking` so the
//! timing is not skewed by the async scheduler.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{ProbeError, ProbeResult, Prober};
use crate::db::Target;

/// Prober that sends one ICMP echo request per call.
#[derive(Debug, Clone)]
pub struct PingProber {
    timeout: Duration,
}

impl PingProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, target: &Target) -> ProbeResult {
        let attempt = tokio::time::timeout(self.timeout, ping(&target.address, self.timeout)).await;
        match attempt {
            Ok(Ok(rtt_ms)) => {
                tracing::debug!("Ping {} ({}): {:.3} ms", target.name, target.address, rtt_ms);
                ProbeResult::reply(target.id, rtt_ms)
            }
            Ok(Err(e)) => {
                tracing::debug!("Ping {} ({}) failed: {}", target.name, target.address, e);
                ProbeResult::failed(target.id, e)
            }
            Err(_) => ProbeResult::failed(target.id, ProbeError::Timeout(self.timeout)),
        }
    }
}

/// Check that an address is an IP literal or a syntactically valid hostname.
pub fn validate_address(address: &str) -> Result<(), ProbeError> {
    static HOSTNAME: OnceLock<Regex> = OnceLock::new();
    let hostname = HOSTNAME.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*\.?$")
            .expect("hostname pattern is valid")
    });

    if address.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if address.len() <= 253 && hostname.is_match(address) {
        return Ok(());
    }
    Err(ProbeError::InvalidAddress(address.to_string()))
}

/// How this process is able to send ICMP.
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static ECHO_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket)");
        return IcmpCapability::Native;
    }
    tracing::info!("Ping probe: native ICMP unavailable, using the ping command");
    IcmpCapability::CommandOnly
}

/// Ping an address once and return the round-trip time in milliseconds.
pub async fn ping(address: &str, timeout: Duration) -> Result<f64, ProbeError> {
    validate_address(address)?;

    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
    if capability == IcmpCapability::CommandOnly {
        return ping_command(address, timeout).await;
    }

    let ip = resolve_address(address).await?;
    let echo = tokio::task::spawn_blocking(move || blocking_echo(ip, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("echo task failed: {}", e)))?;

    match echo {
        Ok(rtt) => Ok(rtt.as_secs_f64() * 1000.0),
        Err(EchoError::PermissionDenied(reason)) => {
            tracing::warn!(
                "Native ICMP to {} not permitted ({}), falling back to the ping command",
                address,
                reason
            );
            ping_command(address, timeout).await
        }
        Err(EchoError::Probe(e)) => Err(e),
    }
}

async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((address, 0))
        .await
        .map_err(|e| ProbeError::InvalidAddress(format!("{}: {}", address, e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::InvalidAddress(format!("{}: no addresses found", address)))
}

#[derive(Debug)]
enum EchoError {
    PermissionDenied(String),
    Probe(ProbeError),
}

impl From<ProbeError> for EchoError {
    fn from(e: ProbeError) -> Self {
        EchoError::Probe(e)
    }
}

/// Per-family ICMP constants.
struct EchoFamily {
    domain: Domain,
    protocol: Protocol,
    request_type: u8,
    reply_type: u8,
    /// ICMPv6 checksums are filled in by the kernel.
    needs_checksum: bool,
}

static ICMPV4: EchoFamily = EchoFamily {
    domain: Domain::IPV4,
    protocol: Protocol::ICMPV4,
    request_type: 8,
    reply_type: 0,
    needs_checksum: true,
};

static ICMPV6: EchoFamily = EchoFamily {
    domain: Domain::IPV6,
    protocol: Protocol::ICMPV6,
    request_type: 128,
    reply_type: 129,
    needs_checksum: false,
};

fn blocking_echo(ip: IpAddr, timeout: Duration) -> Result<Duration, EchoError> {
    let family = match ip {
        IpAddr::V4(_) => &ICMPV4,
        IpAddr::V6(_) => &ICMPV6,
    };

    // RAW needs CAP_NET_RAW; DGRAM works unprivileged where ping_group_range allows it.
    let (socket, raw) = match Socket::new(family.domain, Type::RAW, Some(family.protocol)) {
        Ok(s) => (s, true),
        Err(_) => {
            let s = Socket::new(family.domain, Type::DGRAM, Some(family.protocol))
                .map_err(|e| permission_or_network("open ICMP socket", e))?;
            (s, false)
        }
    };

    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| permission_or_network("connect", e))?;

    let identifier: u16 = rand::random();
    let sequence = ECHO_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(family, identifier, sequence);

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| permission_or_network("send", e))?;

    let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(timeout).into());
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("set timeout: {}", e)))?;

        let len = socket.recv(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                EchoError::Probe(ProbeError::Timeout(timeout))
            }
            _ => permission_or_network("receive", e),
        })?;
        let elapsed = start.elapsed();

        // SAFETY: recv initialized the first `len` bytes.
        let reply = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        // Linux rewrites the identifier of DGRAM echo sockets, so only RAW replies can be matched on it.
        let expected_id = raw.then_some(identifier);
        if is_echo_reply(family, reply, expected_id, sequence) {
            return Ok(elapsed);
        }
    }
}

fn permission_or_network(action: &str, e: std::io::Error) -> EchoError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        EchoError::PermissionDenied(format!("{}: {}", action, e))
    } else {
        EchoError::Probe(ProbeError::Network(format!("{}: {}", action, e)))
    }
}

/// Build an echo request: 8 byte header followed by a 56 byte payload.
fn build_echo_request(family: &EchoFamily, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = family.request_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = chrono::Utc::now().timestamp_micros() as u64;
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

    if family.needs_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// Whether `data` is the reply to our request. RAW IPv4 sockets deliver the IP header too.
fn is_echo_reply(family: &EchoFamily, data: &[u8], identifier: Option<u16>, sequence: u16) -> bool {
    let offset = if family.domain == Domain::IPV4 && data.first().map(|b| b >> 4) == Some(4) {
        usize::from(data[0] & 0x0F) * 4
    } else {
        0
    };
    let Some(icmp) = data.get(offset..offset + 8) else {
        return false;
    };

    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    icmp[0] == family.reply_type
        && reply_seq == sequence
        && identifier.map_or(true, |id| id == reply_id)
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// BSD-derived `ping` reads `-W` as milliseconds and takes the overall
/// deadline in seconds as `-t`; iputils takes seconds as `-W`.
fn ping_command_args(address: &str, timeout: Duration) -> Vec<String> {
    let timeout_secs = timeout.as_secs().max(1).to_string();
    let deadline_flag = if cfg!(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    )) {
        "-t"
    } else {
        "-W"
    };

    ["-n", "-c", "1", deadline_flag, &timeout_secs, address]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

async fn ping_command(address: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let output = Command::new("ping")
        .args(ping_command_args(address, timeout))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(classify_ping_failure(&stdout, &stderr, timeout));
    }

    parse_ping_output(&stdout)
}

fn classify_ping_failure(stdout: &str, stderr: &str, timeout: Duration) -> ProbeError {
    let lower_err = stderr.to_ascii_lowercase();
    if lower_err.contains("unknown host")
        || lower_err.contains("name or service not known")
        || lower_err.contains("cannot resolve")
    {
        return ProbeError::InvalidAddress(stderr.trim().to_string());
    }
    if stdout.contains("Unreachable") || lower_err.contains("unreachable") {
        return ProbeError::Unreachable(stdout.trim().to_string());
    }
    if lower_err.contains("timeout") || stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
        return ProbeError::Timeout(timeout);
    }
    ProbeError::Command(format!("ping failed: {}", stderr.trim()))
}

/// Parse the command output for the round-trip time in milliseconds.
fn parse_ping_output(output: &str) -> Result<f64, ProbeError> {
    static PER_PACKET: OnceLock<Regex> = OnceLock::new();
    static SUMMARY: OnceLock<Regex> = OnceLock::new();

    let per_packet = PER_PACKET
        .get_or_init(|| Regex::new(r"time[=<](?P<ms>[0-9.]+)\s*ms").expect("per-packet pattern is valid"));
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip) min/avg/max/(?:mdev|stddev) = [0-9.]+/(?P<avg>[0-9.]+)/")
            .expect("summary pattern is valid")
    });

    let parsed = per_packet
        .captures(output)
        .and_then(|caps| caps["ms"].parse::<f64>().ok())
        .or_else(|| {
            summary
                .captures(output)
                .and_then(|caps| caps["avg"].parse::<f64>().ok())
        });

    parsed.ok_or_else(|| {
        let first_line = output.lines().next().unwrap_or_default();
        ProbeError::Unparseable(first_line.to_string())
    })
}

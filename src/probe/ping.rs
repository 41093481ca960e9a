//! Ping rounds over native ICMP sockets, with the system `ping` command as fallback.
//!
//! Native echoes run on a blocking socket inside spawn_blocking for
//! sub-millisecond timing precision.

use std::future::Future;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{ProbeConfig, ProbeError, ProbeRound, Prober};
use crate::store::LatencySample;

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Probe once per process whether this host lets us open ICMP sockets.
fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW or root
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping: Raw ICMP sockets available");
        return IcmpCapability::Native;
    }

    // DGRAM works unprivileged on Linux with ping_group_range set, and on macOS
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping: Unprivileged ICMP datagram sockets available");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping: No ICMP socket access, rounds will use the ping command");
    IcmpCapability::CommandOnly
}

/// The production [`Prober`].
#[derive(Debug, Clone)]
pub struct PingProber {
    config: ProbeConfig,
}

impl PingProber {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }
}

impl Prober for PingProber {
    fn probe_round(&self, host: &str) -> impl Future<Output = Result<ProbeRound, ProbeError>> + Send {
        let host = host.to_string();
        let config = self.config;
        async move { run_ping_round(&host, config).await }
    }
}

/// Run one round of `config.count` echo requests against `host`.
pub async fn run_ping_round(host: &str, config: ProbeConfig) -> Result<ProbeRound, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        // Resolve before spawn_blocking (DNS is async)
        let ip = resolve_address(host, config.timeout).await?;

        let result = tokio::task::spawn_blocking(move || run_blocking_round(ip, config))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        return match result {
            Err(ProbeError::Permission(msg)) => {
                tracing::warn!(
                    "Ping: ICMP socket refused for {}, retrying with the ping command: {}",
                    host,
                    msg
                );
                run_ping_command(host, config).await
            }
            other => other,
        };
    }

    run_ping_command(host, config).await
}

/// Resolve `address`, giving the lookup no longer than one echo timeout.
async fn resolve_address(address: &str, timeout: Duration) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<_> = tokio::time::timeout(timeout, tokio::net::lookup_host(format!("{}:0", address)))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .collect();

    addrs
        .into_iter()
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

fn io_error(context: &str, e: std::io::Error) -> ProbeError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        ProbeError::Permission(format!("{}: {}", context, e))
    } else {
        ProbeError::Network(format!("{}: {}", context, e))
    }
}

/// Blocking round on one socket. Lost replies are simply absent from the samples.
fn run_blocking_round(ip: IpAddr, config: ProbeConfig) -> Result<ProbeRound, ProbeError> {
    let socket = IcmpSocket::open(ip, config.timeout)?;
    let identifier: u16 = rand::random();
    let mut samples = Vec::with_capacity(config.count as usize);

    for i in 0..config.count {
        if i > 0 {
            std::thread::sleep(config.spacing);
        }

        let sequence = (i + 1) as u16;
        match socket.echo(identifier, sequence, config.timeout) {
            Ok(rtt) => samples.push(LatencySample {
                sequence: sequence as u32,
                response_time_ms: rtt.as_secs_f64() * 1000.0,
            }),
            Err(ProbeError::Timeout(_)) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(ProbeRound {
        transmitted: config.count,
        samples,
    })
}

struct IcmpSocket {
    socket: Socket,
    v6: bool,
    raw: bool,
}

impl IcmpSocket {
    /// Try RAW first (privileged), then DGRAM (unprivileged).
    fn open(ip: IpAddr, timeout: Duration) -> Result<Self, ProbeError> {
        let (domain, protocol) = match ip {
            IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
            IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
        };

        let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
            Ok(socket) => (socket, true),
            Err(_) => {
                let socket = Socket::new(domain, Type::DGRAM, Some(protocol))
                    .map_err(|e| io_error("failed to create ICMP socket", e))?;
                (socket, false)
            }
        };

        socket
            .set_read_timeout(Some(timeout))
            .map_err(|e| io_error("failed to set timeout", e))?;
        socket
            .set_write_timeout(Some(timeout))
            .map_err(|e| io_error("failed to set timeout", e))?;
        socket
            .connect(&SocketAddr::new(ip, 0).into())
            .map_err(|e| io_error("failed to connect", e))?;

        Ok(Self {
            socket,
            v6: ip.is_ipv6(),
            raw,
        })
    }

    /// Send one echo request and wait for the matching reply.
    fn echo(&self, identifier: u16, sequence: u16, timeout: Duration) -> Result<Duration, ProbeError> {
        let packet = build_echo_request(self.v6, identifier, sequence);

        let start = Instant::now();
        self.socket
            .send(&packet)
            .map_err(|e| io_error("failed to send", e))?;

        // Late replies from earlier sequences may still arrive; skip them.
        loop {
            let remaining = timeout
                .checked_sub(start.elapsed())
                .filter(|d| !d.is_zero())
                .ok_or(ProbeError::Timeout(timeout))?;
            self.socket
                .set_read_timeout(Some(remaining))
                .map_err(|e| io_error("failed to set timeout", e))?;

            let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
            let len = self.socket.recv(&mut buf).map_err(|e| {
                if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
                    ProbeError::Timeout(timeout)
                } else {
                    io_error("failed to receive", e)
                }
            })?;
            // SAFETY: recv initialized `len` bytes
            let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(ProbeError::Timeout(timeout));
            }

            if is_echo_reply(buf, self.v6, self.raw, identifier, sequence) {
                return Ok(elapsed);
            }
        }
    }
}

/// Type, identifier and sequence of the ICMP message in `buf`.
fn parse_icmp_header(buf: &[u8], v6: bool) -> Option<(u8, u16, u16)> {
    // IPv4 sockets may hand us the IP header as well
    let offset = match buf.first() {
        Some(first) if !v6 && first >> 4 == 4 => ((first & 0x0f) as usize) * 4,
        _ => 0,
    };
    let icmp = buf.get(offset..offset + 8)?;
    Some((
        icmp[0],
        u16::from_be_bytes([icmp[4], icmp[5]]),
        u16::from_be_bytes([icmp[6], icmp[7]]),
    ))
}

fn is_echo_reply(buf: &[u8], v6: bool, raw: bool, identifier: u16, sequence: u16) -> bool {
    let Some((kind, reply_id, reply_seq)) = parse_icmp_header(buf, v6) else {
        return false;
    };
    let expected = if v6 { ICMPV6_ECHO_REPLY } else { ICMPV4_ECHO_REPLY };

    // Linux DGRAM sockets rewrite the identifier to the local port, so only
    // RAW replies can be matched on it.
    kind == expected && reply_seq == sequence && (!raw || reply_id == identifier)
}

/// Build an ICMP (type 8) or ICMPv6 (type 128) echo request.
fn build_echo_request(v6: bool, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = if v6 { ICMPV6_ECHO_REQUEST } else { ICMPV4_ECHO_REQUEST };
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    // The kernel fills in the ICMPv6 checksum
    if !v6 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// RFC 1071 internet checksum.
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

/// Run a round through the `ping` binary.
async fn run_ping_command(host: &str, config: ProbeConfig) -> Result<ProbeRound, ProbeError> {
    let wait_secs = config.timeout.as_secs().max(1);
    // ping paces requests at one per second without privileges
    let deadline = Duration::from_secs(config.count as u64) + config.timeout + Duration::from_secs(1);

    let child = Command::new("ping")
        .args([
            "-n",
            "-c",
            &config.count.to_string(),
            "-W",
            &wait_secs.to_string(),
            host,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(deadline, child)
        .await
        .map_err(|_| ProbeError::Timeout(deadline))?
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ping_output(&stdout).ok_or_else(|| {
        let stderr = String::from_utf8_lossy(&output.stderr);
        ProbeError::Command(format!("ping failed: {}", stderr.trim()))
    })
}

/// Parse `ping -c N` output into a round.
///
/// Returns `None` when the summary line is missing, which means ping never
/// got as far as sending (unknown host, bad arguments).
fn parse_ping_output(output: &str) -> Option<ProbeRound> {
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?P<tx>\d+) packets transmitted, (?P<rx>\d+) (?:packets )?received").unwrap()
    });

    static REPLY: OnceLock<Regex> = OnceLock::new();
    let reply = REPLY.get_or_init(|| {
        Regex::new(r"icmp_seq=(?P<seq>\d+).*?time[=<](?P<val>[0-9.]+)\s*ms").unwrap()
    });

    let caps = summary.captures(output)?;
    let transmitted = caps["tx"].parse().ok()?;

    let samples = output
        .lines()
        .filter(|line| !line.contains("DUP!"))
        .filter_map(|line| reply.captures(line))
        .filter_map(|caps| {
            Some(LatencySample {
                sequence: caps["seq"].parse().ok()?,
                response_time_ms: caps["val"].parse().ok()?,
            })
        })
        .collect();

    Some(ProbeRound { transmitted, samples })
}

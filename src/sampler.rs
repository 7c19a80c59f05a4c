//! Packet sampler.
//!
//! Runs `tcpdump` for one fixed window and turns its quiet one-line-per-packet
//! output into per-remote byte counts.  Each packet is classified as inbound or
//! outbound relative to the local host; traffic between two non-routable
//! endpoints, or between two foreign public endpoints, is dropped.
//!
//! When the host's own addresses are known, only packets with one of them on
//! the local side are counted.  A container's bridged flow shows up once on
//! its veth with the container address and once more on the uplink after
//! NAT; only the uplink copy carries a host address.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::time::{timeout, timeout_at, Instant};

use crate::error::{Result, TrackerError};
use crate::types::{Direction, SampleDelta};

#[async_trait]
pub trait Capture: Send + Sync {
    /// Samples traffic for exactly `duration`, ignoring whatever matches the
    /// BPF expression `exclude`.
    async fn capture(&self, duration: Duration, exclude: &str) -> Result<Vec<SampleDelta>>;
}

/// Addresses that belong to this host.
#[derive(Debug, Clone, Default)]
pub struct LocalAddrs(Vec<IpAddr>);

impl LocalAddrs {
    pub fn new(addrs: Vec<IpAddr>) -> Self {
        Self(addrs)
    }

    /// Learns the addresses used for outbound traffic.  Connecting a UDP
    /// socket only selects a route, no packet is sent.
    pub async fn discover() -> Self {
        let mut addrs = Vec::new();
        let probes: [(SocketAddr, SocketAddr); 2] = [
            (
                (Ipv4Addr::UNSPECIFIED, 0).into(),
                (Ipv4Addr::new(8, 8, 8, 8), 53).into(),
            ),
            (
                (Ipv6Addr::UNSPECIFIED, 0).into(),
                (Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888), 53).into(),
            ),
        ];
        for (bind, target) in probes {
            let Ok(socket) = UdpSocket::bind(bind).await else {
                continue;
            };
            if socket.connect(target).await.is_err() {
                continue;
            }
            if let Ok(local) = socket.local_addr() {
                addrs.push(local.ip());
            }
        }
        if addrs.is_empty() {
            warn!("Could not discover a local address; relying on private ranges only");
        } else {
            info!("Discovered local addresses: {:?}", addrs);
        }
        Self(addrs)
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        self.0.contains(ip)
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub struct TcpdumpCapture {
    interface: String,
    local: LocalAddrs,
    grace: Duration,
}

impl TcpdumpCapture {
    pub fn new(interface: String, local: LocalAddrs, grace: Duration) -> Self {
        Self {
            interface,
            local,
            grace,
        }
    }

    fn filter(exclude: &str) -> String {
        if exclude.trim().is_empty() {
            "tcp or udp".to_string()
        } else {
            format!("(tcp or udp) and not ({})", exclude)
        }
    }
}

#[async_trait]
impl Capture for TcpdumpCapture {
    async fn capture(&self, duration: Duration, exclude: &str) -> Result<Vec<SampleDelta>> {
        let mut child = Command::new("tcpdump")
            .args(["-i", &self.interface, "-n", "-q", "-t", "-l"])
            .arg(Self::filter(exclude))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TrackerError::CaptureUnavailable(format!("spawn tcpdump: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TrackerError::CaptureUnavailable("no stdout from tcpdump".into()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut window = Window::new(&self.local);
        let deadline = Instant::now() + duration;

        let outcome = loop {
            match timeout_at(deadline, lines.next_line()).await {
                Err(_) => break Ok(()),
                Ok(Ok(Some(line))) => window.observe(&line),
                Ok(Ok(None)) => {
                    break Err(TrackerError::CaptureUnavailable(
                        "tcpdump exited before the window closed".into(),
                    ))
                }
                Ok(Err(e)) => break Err(TrackerError::Io(e)),
            }
        };

        if timeout(self.grace, child.kill()).await.is_err() {
            warn!("tcpdump did not exit within {:?} of the kill signal", self.grace);
        }
        outcome?;

        if window.unparsed > 0 {
            debug!("Skipped {} unparseable capture lines", window.unparsed);
        }
        Ok(window.into_deltas())
    }
}

/// Per-window accumulator keyed by (direction, remote address).
pub struct Window<'a> {
    local: &'a LocalAddrs,
    bytes: HashMap<(Direction, IpAddr), u64>,
    unparsed: usize,
}

impl<'a> Window<'a> {
    pub fn new(local: &'a LocalAddrs) -> Self {
        Self {
            local,
            bytes: HashMap::new(),
            unparsed: 0,
        }
    }

    pub fn observe(&mut self, line: &str) {
        let Some((src, dst, len)) = parse_line(line) else {
            self.unparsed += 1;
            return;
        };
        if let Some(key) = classify(src, dst, self.local) {
            let total = self.bytes.entry(key).or_insert(0);
            *total = total.saturating_add(len);
        }
    }

    pub fn into_deltas(self) -> Vec<SampleDelta> {
        let mut deltas: Vec<SampleDelta> = self
            .bytes
            .into_iter()
            .map(|((direction, remote), bytes)| SampleDelta {
                direction,
                remote,
                bytes,
            })
            .collect();
        deltas.sort_by(|a, b| (a.direction, a.remote).cmp(&(b.direction, b.remote)));
        deltas
    }
}

/// Parses one line of `tcpdump -n -q -t` output into source, destination and
/// length.  With `-i any` the line starts with the interface and a direction
/// column, which are skipped.
fn parse_line(line: &str) -> Option<(IpAddr, IpAddr, u64)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let start = tokens.iter().position(|t| *t == "IP" || *t == "IP6")?;
    let rest = &tokens[start + 1..];
    if rest.len() < 4 || rest[1] != ">" {
        return None;
    }
    let src = parse_endpoint(rest[0])?;
    let dst = parse_endpoint(rest[2].trim_end_matches(':'))?;
    let len = rest
        .iter()
        .rev()
        .find_map(|t| t.trim_end_matches(',').parse::<u64>().ok())?;
    Some((src, dst, len))
}

/// Accepts `addr.port` (both IPv4 and IPv6 in tcpdump notation) or a bare
/// address.
fn parse_endpoint(s: &str) -> Option<IpAddr> {
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some(ip);
    }
    let (host, port) = s.rsplit_once('.')?;
    port.parse::<u16>().ok()?;
    host.parse::<IpAddr>().ok()
}

/// Private, loopback, link-local and other addresses that never name a
/// remote peer.
pub fn is_non_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Returns the direction and remote address of a packet, or `None` if it is
/// not traffic between this host and a public peer.  Non-routable addresses
/// only stand in for the local side when no host address is known.
pub fn classify(src: IpAddr, dst: IpAddr, local: &LocalAddrs) -> Option<(Direction, IpAddr)> {
    let is_ours = |ip: &IpAddr| {
        if local.is_empty() {
            is_non_routable(ip)
        } else {
            local.contains(ip)
        }
    };
    let is_remote = |ip: &IpAddr| !local.contains(ip) && !is_non_routable(ip);

    if is_ours(&src) && is_remote(&dst) {
        Some((Direction::Out, dst))
    } else if is_ours(&dst) && is_remote(&src) {
        Some((Direction::In, src))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn parses_any_interface_lines() {
        let line = "eth0  In  IP 1.2.3.4.443 > 203.0.113.9.51234: tcp 1448";
        assert_eq!(
            parse_line(line),
            Some((ip("1.2.3.4"), ip("203.0.113.9"), 1448))
        );

        let udp = "IP 10.0.0.5.40000 > 5.6.7.8.53: UDP, length 40";
        assert_eq!(parse_line(udp), Some((ip("10.0.0.5"), ip("5.6.7.8"), 40)));

        let v6 = "IP6 2001:db8::1.443 > 2001:db8::2.50000: tcp 100";
        assert_eq!(
            parse_line(v6),
            Some((ip("2001:db8::1"), ip("2001:db8::2"), 100))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_line("tcpdump: listening on any"), None);
        assert_eq!(parse_line("IP truncated"), None);
        assert_eq!(parse_line("IP 1.2.3.4.1 > nonsense: tcp 5"), None);
    }

    #[test]
    fn classifies_relative_to_local_host() {
        let local = LocalAddrs::new(vec![ip("203.0.113.9")]);
        assert_eq!(
            classify(ip("1.2.3.4"), ip("203.0.113.9"), &local),
            Some((Direction::In, ip("1.2.3.4")))
        );
        assert_eq!(
            classify(ip("203.0.113.9"), ip("5.6.7.8"), &local),
            Some((Direction::Out, ip("5.6.7.8")))
        );
        // Bridge side of a NAT'd flow; the uplink copy is the one counted.
        assert_eq!(classify(ip("172.17.0.2"), ip("5.6.7.8"), &local), None);
        assert_eq!(classify(ip("5.6.7.8"), ip("172.17.0.2"), &local), None);
        assert_eq!(classify(ip("10.0.0.1"), ip("192.168.1.1"), &local), None);
        assert_eq!(classify(ip("127.0.0.1"), ip("127.0.0.1"), &local), None);
        assert_eq!(classify(ip("1.1.1.1"), ip("8.8.8.8"), &local), None);
        assert_eq!(classify(ip("fe80::1"), ip("fd00::2"), &local), None);
    }

    #[test]
    fn window_sums_per_direction_and_address() {
        let local = LocalAddrs::new(vec![ip("203.0.113.9")]);
        let mut window = Window::new(&local);
        window.observe("IP 1.2.3.4.443 > 203.0.113.9.5000: tcp 200");
        window.observe("IP 1.2.3.4.443 > 203.0.113.9.5000: tcp 300");
        window.observe("IP 203.0.113.9.5000 > 1.2.3.4.443: tcp 50");
        window.observe("IP 203.0.113.9.5000 > 5.6.7.8.443: tcp 300");
        window.observe("not a packet");

        assert_eq!(window.unparsed, 1);
        let deltas = window.into_deltas();
        assert_eq!(
            deltas,
            vec![
                SampleDelta {
                    direction: Direction::In,
                    remote: ip("1.2.3.4"),
                    bytes: 500
                },
                SampleDelta {
                    direction: Direction::Out,
                    remote: ip("1.2.3.4"),
                    bytes: 50
                },
                SampleDelta {
                    direction: Direction::Out,
                    remote: ip("5.6.7.8"),
                    bytes: 300
                },
            ]
        );
    }

    #[test]
    fn bridged_packet_is_counted_once() {
        let local = LocalAddrs::new(vec![ip("203.0.113.9")]);
        let mut window = Window::new(&local);
        // Same packet on the container veth, on docker0 and on the uplink.
        window.observe("veth1a2b Out IP 172.17.0.2.5000 > 5.6.7.8.443: tcp 300");
        window.observe("docker0 In IP 172.17.0.2.5000 > 5.6.7.8.443: tcp 300");
        window.observe("eth0 Out IP 203.0.113.9.5000 > 5.6.7.8.443: tcp 300");
        // And the reply, before and after reverse NAT.
        window.observe("eth0 In IP 5.6.7.8.443 > 203.0.113.9.5000: tcp 80");
        window.observe("veth1a2b In IP 5.6.7.8.443 > 172.17.0.2.5000: tcp 80");

        assert_eq!(
            window.into_deltas(),
            vec![
                SampleDelta {
                    direction: Direction::In,
                    remote: ip("5.6.7.8"),
                    bytes: 80
                },
                SampleDelta {
                    direction: Direction::Out,
                    remote: ip("5.6.7.8"),
                    bytes: 300
                },
            ]
        );
    }

    #[test]
    fn private_ranges_stand_in_without_local_addresses() {
        let local = LocalAddrs::default();
        assert_eq!(
            classify(ip("192.168.1.10"), ip("5.6.7.8"), &local),
            Some((Direction::Out, ip("5.6.7.8")))
        );
        assert_eq!(
            classify(ip("1.2.3.4"), ip("10.0.0.5"), &local),
            Some((Direction::In, ip("1.2.3.4")))
        );
        assert_eq!(classify(ip("1.2.3.4"), ip("5.6.7.8"), &local), None);
    }

    #[test]
    fn builds_filter_expression() {
        assert_eq!(TcpdumpCapture::filter(""), "tcp or udp");
        assert_eq!(
            TcpdumpCapture::filter("port 22"),
            "(tcp or udp) and not (port 22)"
        );
    }
}

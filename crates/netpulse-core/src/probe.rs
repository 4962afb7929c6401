//! ICMP echo probing.
//!
//! `Prober` is the capability seam between the sweep/monitor loops and the
//! wire: production uses one shared `surge_ping::Client` (a single raw
//! socket multiplexed across every pinger), tests script outcomes per IP.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use surge_ping::{Client, Config, PingIdentifier, PingSequence};

/// Fixed echo payload; 56 bytes matches the classic `ping` default.
const ECHO_PAYLOAD: [u8; 56] = [0u8; 56];

/// Issues a single echo and reports the round-trip time, if any.
///
/// `None` covers every failure mode the caller treats identically: timeout,
/// unreachable, socket error, or a reply with a zero RTT (the library can
/// report one on clock weirdness; a measurement of zero is not a liveness
/// proof).
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> Option<Duration>;
}

/// Production prober backed by a shared privileged ICMP socket.
pub struct IcmpProber {
    client: Client,
}

impl IcmpProber {
    /// Opens the raw ICMP socket. Fails without CAP_NET_RAW / root, which is
    /// a startup-fatal condition for the daemon.
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::new(&Config::default())
            .context("failed to open ICMP socket (requires CAP_NET_RAW)")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> Option<Duration> {
        let mut pinger = self
            .client
            .pinger(IpAddr::V4(ip), PingIdentifier(rand::random()))
            .await;
        pinger.timeout(timeout);
        match pinger.ping(PingSequence(0), &ECHO_PAYLOAD).await {
            Ok((_reply, rtt)) if rtt > Duration::ZERO => Some(rtt),
            Ok(_) => None,
            Err(_) => None,
        }
    }
}

/// Whether an address may be probed at all: unicast, not loopback, not
/// multicast, not link-local, not unspecified, not limited-broadcast.
/// Applied at config validation, at sweep expansion, and again by each
/// monitor iteration in case the registry was fed a bad entry.
pub fn is_probe_safe(ip: Ipv4Addr) -> bool {
    !(ip.is_loopback()
        || ip.is_multicast()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast())
}

//! Discovery: a `DISCOVER` probe answered with `NAME:..,IPS:..`.
//!
//! The responder side lives inside the import loop. The initiator sends one
//! probe and waits a bounded time for a reply from the target.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use tokio::time::Instant;

use ferry_core::config::IdentityConfig;
use ferry_core::{Message, PeerIdentity, TransferError};

use crate::transport::Datagram;

/// Name used when neither config nor the host provides one.
const FALLBACK_NAME: &str = "ferry";

// Never actually contacted: connecting a UDP socket only picks a route.
const ROUTE_PROBE: &str = "8.8.8.8:53";

/// Build the identity this host advertises, from config where set and
/// detected values otherwise.
pub fn local_identity(config: &IdentityConfig) -> PeerIdentity {
    let name = if config.name.is_empty() {
        host_name()
    } else {
        config.name.clone()
    };
    let addresses = if config.addresses.is_empty() {
        detect_addresses()
    } else {
        config.addresses.clone()
    };
    PeerIdentity { name, addresses }
}

fn host_name() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

/// Every IPv4 address on an up, non-loopback interface. Falls back to the
/// default-route address, then to loopback when offline.
fn detect_addresses() -> Vec<IpAddr> {
    let addresses = advertisable(interface_addresses());
    if !addresses.is_empty() {
        return addresses;
    }

    let routed = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect(ROUTE_PROBE)?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok();

    match advertisable(routed).pop() {
        Some(ip) => vec![ip],
        None => {
            tracing::debug!("no routable address detected, advertising loopback");
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        }
    }
}

fn interface_addresses() -> Vec<IpAddr> {
    let interfaces = match getifaddrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::debug!(error = %e, "interface enumeration failed");
            return Vec::new();
        }
    };
    interfaces
        .filter(|ifa| {
            ifa.flags.contains(InterfaceFlags::IFF_UP)
                && !ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        })
        .filter_map(|ifa| {
            let sin = ifa.address.as_ref()?.as_sockaddr_in()?;
            Some(IpAddr::V4(*SocketAddrV4::from(*sin).ip()))
        })
        .collect()
}

/// IPv4 only, minus loopback and unspecified, first occurrence kept.
fn advertisable(candidates: impl IntoIterator<Item = IpAddr>) -> Vec<IpAddr> {
    let mut out: Vec<IpAddr> = Vec::new();
    for ip in candidates {
        if ip.is_ipv4() && !ip.is_loopback() && !ip.is_unspecified() && !out.contains(&ip) {
            out.push(ip);
        }
    }
    out
}

/// Answers discovery probes with a pre-encoded reply.
#[derive(Debug, Clone)]
pub struct Responder {
    identity: PeerIdentity,
    reply: Vec<u8>,
}

impl Responder {
    pub fn new(identity: PeerIdentity) -> Self {
        let reply = Message::DiscoverReply(identity.clone()).encode();
        Self { identity, reply }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub async fn answer(&self, transport: &dyn Datagram, to: SocketAddr) -> Result<(), TransferError> {
        transport.send(to, &self.reply).await?;
        tracing::debug!(peer = %to, "answered discovery probe");
        Ok(())
    }
}

/// Probe `target` and wait up to `timeout` for its identity.
///
/// Anything other than a well-formed reply from the target is ignored while
/// the clock runs. No reply at all is `PeerUnreachable`.
pub async fn discover(
    transport: &dyn Datagram,
    target: SocketAddr,
    timeout: Duration,
) -> Result<PeerIdentity, TransferError> {
    transport.send(target, &Message::Discover.encode()).await?;
    tracing::debug!(%target, ?timeout, "discovery probe sent");

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransferError::PeerUnreachable(target));
        }

        let (bytes, from) = match transport.receive(remaining).await {
            Ok(received) => received,
            Err(e) if e.is_timeout() => return Err(TransferError::PeerUnreachable(target)),
            Err(e) => return Err(e),
        };

        if from != target {
            tracing::trace!(%from, %target, "datagram from unexpected source ignored");
            continue;
        }
        match Message::decode(&bytes) {
            Ok(Message::DiscoverReply(identity)) => {
                tracing::info!(%target, name = %identity.name, "peer discovered");
                return Ok(identity);
            }
            Ok(other) => {
                tracing::trace!(%target, kind = other.kind(), "ignoring non-reply during discovery");
            }
            Err(e) => {
                tracing::debug!(%target, error = %e, "malformed discovery reply");
            }
        }
    }
}

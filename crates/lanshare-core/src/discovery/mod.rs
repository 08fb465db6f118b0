//! Peer discovery over UDP broadcast.
//!
//! A receiving device announces itself by broadcasting its display name to
//! the local subnet once per interval. A sending device listens on the same
//! port and reports each new address it hears from exactly once.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Largest announcement payload we accept.
const MAX_ANNOUNCEMENT_LENGTH: usize = 256;

/// Capacity of the discovered-peer channel.
const PEER_CHANNEL_CAPACITY: usize = 32;

/// A device discovered on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    /// Display name from the announcement
    pub name: String,
    /// Source address of the announcement
    pub addr: IpAddr,
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.addr)
    }
}

fn broadcast_socket() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::BroadcastFailed(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| Error::BroadcastFailed(e.to_string()))?;
    socket
        .bind(&SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into())
        .map_err(|e| Error::BroadcastFailed(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::BroadcastFailed(e.to_string()))?;

    UdpSocket::from_std(socket.into()).map_err(|e| Error::BroadcastFailed(e.to_string()))
}

fn listen_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::DiscoveryBindFailed(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::DiscoveryBindFailed(e.to_string()))?;
    // Lets a restarted listener rebind while the old socket is closing.
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| Error::DiscoveryBindFailed(e.to_string()))?;
    socket
        .bind(&SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())
        .map_err(|e| Error::DiscoveryBindFailed(format!("port {port}: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::DiscoveryBindFailed(e.to_string()))?;

    UdpSocket::from_std(socket.into()).map_err(|e| Error::DiscoveryBindFailed(e.to_string()))
}

/// Best-effort local address, for filtering our own announcements.
///
/// Opens a UDP socket toward a public address; no packets are sent.
#[must_use]
pub fn local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Broadcast `name` to the subnet every `interval` until cancelled.
///
/// Individual send failures are logged and retried on the next tick; only
/// socket setup fails the task.
///
/// # Errors
///
/// Returns an error if the broadcast socket cannot be created.
pub async fn announce_presence(
    name: String,
    port: u16,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let socket = broadcast_socket()?;
    let target = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::BROADCAST, port));
    let payload = name.into_bytes();

    debug!(port, "announcing presence on local network");

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("presence announcements stopped");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&payload, target).await {
                    warn!(error = %e, "broadcast send failed");
                }
            }
        }
    }
}

/// Listen for announcements and report each new peer address once.
///
/// Announcements from `skip` (normally our own address) are ignored, as are
/// repeat announcements from an address already reported. The task runs
/// until cancelled or the returned channel is dropped.
///
/// # Errors
///
/// Returns an error if the listen socket cannot be bound.
pub fn discover_peers(
    port: u16,
    skip: Option<IpAddr>,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<Peer>> {
    let socket = listen_socket(port)?;
    let (tx, rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut seen: HashSet<IpAddr> = HashSet::new();
        let mut buf = [0u8; MAX_ANNOUNCEMENT_LENGTH];

        debug!(port, "listening for peer announcements");

        loop {
            let (len, from) = tokio::select! {
                () = cancel.cancelled() => {
                    debug!("peer discovery stopped");
                    return;
                }
                result = socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "discovery receive failed");
                        continue;
                    }
                },
            };

            let from_ip = from.ip();
            if Some(from_ip) == skip {
                trace!(%from_ip, "ignoring our own announcement");
                continue;
            }
            if seen.contains(&from_ip) {
                continue;
            }

            let Ok(name) = std::str::from_utf8(&buf[..len]) else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }

            seen.insert(from_ip);
            let peer = Peer {
                name: name.to_string(),
                addr: from_ip,
            };
            debug!(peer = %peer, "discovered peer");
            if tx.send(peer).await.is_err() {
                return;
            }
        }
    });

    Ok(rx)
}

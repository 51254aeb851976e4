//! Topic discovery
//!
//! Peers sharing a topic find each other through UDP multicast beacons on the
//! local network, and through a static bootstrap list for networks where
//! multicast does not reach.

use crate::crypto::KeyPair;
use clawverse_core::protocol::MIN_SUPPORTED_VERSION;
use clawverse_core::{DiscoveryKey, PeerId, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default multicast group for beacons
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);

/// Default UDP port for beacons
pub const DEFAULT_DISCOVERY_PORT: u16 = 19821;

/// Largest beacon we are willing to parse
const MAX_BEACON_SIZE: usize = 512;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to open multicast socket on port {port}: {source}")]
    Socket {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Discovery configuration
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Announce and listen on the LAN multicast group
    pub multicast: bool,
    /// Multicast group address
    pub group: Ipv4Addr,
    /// UDP port for beacons
    pub port: u16,
    /// Addresses dialed regardless of multicast
    pub bootstrap: Vec<SocketAddr>,
    /// Beacon and bootstrap retry interval
    pub interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast: true,
            group: DEFAULT_MULTICAST_GROUP,
            port: DEFAULT_DISCOVERY_PORT,
            bootstrap: Vec::new(),
            interval: Duration::from_secs(4),
        }
    }
}

/// A peer worth dialing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// Address the peer accepts connections on
    pub addr: SocketAddr,
    /// Identifier, when the beacon revealed it. Bootstrap entries have none.
    pub peer_id: Option<PeerId>,
}

/// Multicast beacon payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub protocol_version: u32,
    pub discovery_key: DiscoveryKey,
    pub public_key: [u8; 32],
    pub listen_port: u16,
}

impl Beacon {
    /// Turn a received beacon into a dial candidate.
    ///
    /// Returns `None` for beacons on another topic, from an unsupported
    /// protocol version, or sent by ourselves.
    pub fn candidate(&self, from: SocketAddr, key: &DiscoveryKey, local_id: &PeerId) -> Option<Candidate> {
        if self.discovery_key != *key || self.protocol_version < MIN_SUPPORTED_VERSION {
            return None;
        }
        let peer_id = PeerId::from_public_key(&self.public_key);
        if peer_id == *local_id {
            return None;
        }
        Some(Candidate {
            addr: SocketAddr::new(from.ip(), self.listen_port),
            peer_id: Some(peer_id),
        })
    }
}

/// Running discovery for one topic
pub struct Discovery {
    config: DiscoveryConfig,
    key: DiscoveryKey,
    local_id: PeerId,
    beacon: Vec<u8>,
    socket: Option<UdpSocket>,
}

impl Discovery {
    /// Prepare discovery, opening the multicast socket when enabled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(
        config: DiscoveryConfig,
        key: DiscoveryKey,
        keypair: &KeyPair,
        listen_port: u16,
    ) -> Result<Self, DiscoveryError> {
        let beacon = postcard::to_allocvec(&Beacon {
            protocol_version: PROTOCOL_VERSION,
            discovery_key: key,
            public_key: keypair.public_key(),
            listen_port,
        })?;

        let socket = if config.multicast {
            let socket = multicast_socket(config.group, config.port).map_err(|source| {
                DiscoveryError::Socket {
                    port: config.port,
                    source,
                }
            })?;
            Some(socket)
        } else {
            None
        };

        Ok(Self {
            config,
            key,
            local_id: keypair.peer_id(),
            beacon,
            socket,
        })
    }

    /// Announce and collect candidates until cancelled.
    pub async fn run(self, candidates: mpsc::Sender<Candidate>, cancel: CancellationToken) {
        let dest = SocketAddr::V4(SocketAddrV4::new(self.config.group, self.config.port));
        let mut ticker = tokio::time::interval(self.config.interval);
        let mut buf = vec![0u8; MAX_BEACON_SIZE];

        info!(
            "Discovery running (multicast: {}, bootstrap peers: {})",
            self.socket.is_some(),
            self.config.bootstrap.len()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(socket) = &self.socket {
                        if let Err(e) = socket.send_to(&self.beacon, dest).await {
                            debug!("Beacon send failed: {}", e);
                        }
                    }
                    for addr in &self.config.bootstrap {
                        let candidate = Candidate { addr: *addr, peer_id: None };
                        if candidates.send(candidate).await.is_err() {
                            return;
                        }
                    }
                }
                received = recv_beacon(self.socket.as_ref(), &mut buf) => {
                    let (n, from) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("Beacon receive failed: {}", e);
                            continue;
                        }
                    };
                    let Ok(beacon) = postcard::from_bytes::<Beacon>(&buf[..n]) else {
                        trace!("Ignoring malformed beacon from {}", from);
                        continue;
                    };
                    if let Some(candidate) = beacon.candidate(from, &self.key, &self.local_id) {
                        if candidates.send(candidate).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }

        debug!("Discovery stopped");
    }
}

async fn recv_beacon(socket: Option<&UdpSocket>, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

fn multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

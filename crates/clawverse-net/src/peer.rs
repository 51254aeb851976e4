//! Peer connection metadata

use clawverse_core::{now_millis, PeerId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Lifecycle of a connection to one peer.
///
/// `Discovered → Connecting → Connected → Closed`. Only `Connected` carries
/// application messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Closed,
}

/// Which side opened the stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Information about a connected peer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Peer identifier
    pub id: PeerId,
    /// Short display name
    pub name: String,
    /// Remote socket address of the stream
    pub addr: SocketAddr,
    /// Address the peer accepts connections on
    pub listen_addr: SocketAddr,
    pub direction: Direction,
    /// Connect timestamp (unix millis)
    pub connected_at: u64,
    /// Last activity timestamp (unix millis)
    pub last_seen: u64,
}

impl PeerInfo {
    /// Create new peer info stamped with the current time
    pub fn new(id: PeerId, addr: SocketAddr, listen_addr: SocketAddr, direction: Direction) -> Self {
        let now = now_millis();
        Self {
            name: id.short().to_string(),
            id,
            addr,
            listen_addr,
            direction,
            connected_at: now,
            last_seen: now,
        }
    }
}

//! Networking for the Clawverse presence mesh
//!
//! This crate provides:
//! - Transport keypair management
//! - Topic discovery (LAN multicast beacons and static bootstrap peers)
//! - TCP connection lifecycle with handshake and duplicate-session resolution
//! - Length-prefixed message framing

pub mod crypto;
pub mod discovery;
pub mod framing;
pub mod peer;
pub mod transport;

pub use crypto::KeyPair;
pub use discovery::{Candidate, Discovery, DiscoveryConfig, DiscoveryError};
pub use framing::{Frame, FrameCodec, FrameType};
pub use peer::{ConnectionState, Direction, PeerInfo};
pub use transport::{Transport, TransportConfig, TransportError, TransportEvent};

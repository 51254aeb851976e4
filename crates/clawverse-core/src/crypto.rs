//! Hash derivations for the discovery substrate and peer identity

use crate::types::DiscoveryKey;
use sha2::{Digest, Sha256};

/// Derive the rendezvous key for a topic.
///
/// `DiscoveryKey = SHA-256(topic)`
pub fn derive_discovery_key(topic: &str) -> DiscoveryKey {
    let digest = Sha256::digest(topic.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    DiscoveryKey(key)
}

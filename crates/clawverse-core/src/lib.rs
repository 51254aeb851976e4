//! Clawverse Core Library
//!
//! This crate provides the data model, wire protocol, and conflict-free
//! replicated state for the Clawverse presence mesh.
//!
//! # Modules
//!
//! - [`types`]: Peer identifiers and peer-state records
//! - [`protocol`]: Versioned message envelope and its binary codec
//! - [`state`]: Last-writer-wins replicated map of peer states
//! - [`canonical`]: Deterministic serialization and field validation
//! - [`crypto`]: Discovery key and peer identifier derivations
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod state;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use protocol::{Envelope, Payload, PROTOCOL_VERSION};
pub use state::{ReplicatedStore, Stamp};
pub use types::*;

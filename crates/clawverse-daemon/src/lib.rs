//! clawverse-daemon - Clawverse presence daemon
//!
//! This daemon provides:
//! - Peer discovery and connections on a shared topic
//! - Replicated presence state (position, mood, hardware) for every peer
//! - Periodic heartbeats carrying local load and position
//! - A loopback HTTP API for local tools

pub mod config;
pub mod http;
pub mod metrics;
pub mod presence;
pub mod server;

pub use config::Config;
pub use metrics::{MetricsSource, SystemMonitor};
pub use presence::{Orchestrator, PresenceEvent, PresenceHandle};
pub use server::Server;

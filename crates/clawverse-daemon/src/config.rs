//! Configuration for the clawverse daemon

use crate::presence::PresenceConfig;
use clap::{Parser, ValueEnum};
use clawverse_core::Identity;
use clawverse_net::{DiscoveryConfig, TransportConfig};
use std::net::SocketAddr;
use std::time::Duration;

/// Shortest heartbeat interval we accept
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 100;

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// clawverse - P2P presence daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "clawverse", version)]
#[command(about = "Clawverse presence daemon")]
pub struct Config {
    /// Topic shared by every peer of the mesh
    #[arg(long, env = "CLAWVERSE_TOPIC", default_value = "clawverse-v1")]
    pub topic: String,

    /// Local HTTP API port (bound on 127.0.0.1)
    #[arg(short, long, env = "CLAWVERSE_PORT", default_value_t = 19820)]
    pub port: u16,

    /// Heartbeat interval in milliseconds
    #[arg(long, env = "CLAWVERSE_HEARTBEAT_INTERVAL", default_value_t = 5000)]
    pub heartbeat_interval_ms: u64,

    /// Enable debug logging
    #[arg(short, long, env = "CLAWVERSE_DEBUG")]
    pub debug: bool,

    /// Listen address for peer connections
    #[arg(short, long, default_value = "0.0.0.0:0")]
    pub listen: SocketAddr,

    /// UDP port for LAN discovery beacons
    #[arg(long, default_value_t = 19821)]
    pub discovery_port: u16,

    /// Disable LAN multicast discovery
    #[arg(long)]
    pub no_multicast: bool,

    /// Bootstrap peers (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<SocketAddr>,

    /// Display name (defaults to the short peer id)
    #[arg(long)]
    pub name: Option<String>,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.topic.trim().is_empty() {
            anyhow::bail!("Topic cannot be empty");
        }
        if self.heartbeat_interval_ms < MIN_HEARTBEAT_INTERVAL_MS {
            anyhow::bail!(
                "Heartbeat interval must be at least {}ms (got {}ms)",
                MIN_HEARTBEAT_INTERVAL_MS,
                self.heartbeat_interval_ms
            );
        }
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                anyhow::bail!("Name cannot be blank");
            }
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Loopback address of the HTTP API
    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }

    /// Default log filter directive
    pub fn log_directive(&self) -> &'static str {
        if self.debug {
            "clawverse=debug"
        } else {
            "clawverse=info"
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            topic: self.topic.clone(),
            listen_addr: self.listen,
            discovery: DiscoveryConfig {
                multicast: !self.no_multicast,
                port: self.discovery_port,
                bootstrap: self.bootstrap.clone(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            name: self.name.clone(),
            identity: Identity::default(),
            heartbeat_interval: self.heartbeat_interval(),
        }
    }
}

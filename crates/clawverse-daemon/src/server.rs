//! Daemon server - wires the hardware monitor, presence orchestrator and
//! HTTP API together

use crate::config::Config;
use crate::http::{self, ApiState};
use crate::metrics::{MetricsSource, SystemMonitor};
use crate::presence::{Orchestrator, PresenceError};
use clawverse_net::KeyPair;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Presence error: {0}")]
    Presence(#[from] PresenceError),
}

/// Server state
pub struct Server {
    config: Config,
    keypair: KeyPair,
    monitor: Arc<SystemMonitor>,
    cancel: CancellationToken,
}

impl Server {
    /// Create a new server instance with a fresh identity
    pub fn new(config: Config) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        Ok(Self {
            config,
            keypair: KeyPair::generate(),
            monitor: SystemMonitor::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops [`run`](Self::run) when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until shutdown. Startup failures (peer listener, multicast
    /// socket, HTTP port) are returned.
    pub async fn run(&self) -> Result<(), ServerError> {
        info!("Topic: {}", self.config.topic);
        info!("HTTP port: {}", self.config.port);
        info!("Heartbeat interval: {}ms", self.config.heartbeat_interval_ms);

        let monitor_task = self
            .monitor
            .spawn(self.config.heartbeat_interval(), self.cancel.child_token());
        let metrics: Arc<dyn MetricsSource> = self.monitor.clone();

        let started = Orchestrator::start(
            self.keypair.clone(),
            self.config.transport_config(),
            self.config.presence_config(),
            Arc::clone(&metrics),
            self.cancel.child_token(),
        )
        .await;
        let (presence, presence_task) = match started {
            Ok(started) => started,
            Err(e) => {
                self.shutdown();
                let _ = monitor_task.await;
                return Err(e.into());
            }
        };
        info!("Peer id: {}", presence.local_id());

        let listener = match TcpListener::bind(self.config.http_addr()).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind HTTP API on {}: {}", self.config.http_addr(), e);
                self.shutdown();
                let _ = presence_task.await;
                let _ = monitor_task.await;
                return Err(e.into());
            }
        };
        let state = ApiState {
            presence: presence.clone(),
            metrics,
        };
        let http_task = tokio::spawn(http::serve(listener, state, self.cancel.child_token()));

        info!("Daemon running. Press Ctrl+C to stop.");
        self.cancel.cancelled().await;
        info!("Shutting down...");

        if let Err(e) = presence_task.await {
            warn!("Presence task ended abnormally: {}", e);
        }
        match http_task.await {
            Ok(Err(e)) => warn!("HTTP API error: {}", e),
            Err(e) => warn!("HTTP task ended abnormally: {}", e),
            Ok(Ok(())) => {}
        }
        let _ = monitor_task.await;
        Ok(())
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

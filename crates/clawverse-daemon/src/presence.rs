//! Presence orchestrator
//!
//! A single task owns the [`ReplicatedStore`] and serializes everything that
//! touches it: transport events, requests from [`PresenceHandle`]s and the
//! heartbeat timer. Nothing else reads or writes the store.

use crate::metrics::MetricsSource;
use clawverse_core::protocol::{Announce, Heartbeat, PrivateMessage};
use clawverse_core::{
    now_millis, Envelope, Identity, LoadSample, Payload, PeerId, PeerStatePatch, PeerStateRecord,
    Position, ReplicatedStore, Stamp,
};
use clawverse_net::{KeyPair, PeerInfo, Transport, TransportConfig, TransportError, TransportEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE: usize = 64;
const EVENT_BUFFER: usize = 256;

/// Presence errors
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Invalid position ({x}, {y})")]
    InvalidPosition { x: f64, y: f64 },
    #[error("Presence service stopped")]
    Stopped,
}

/// Presence settings for the local node
#[derive(Clone, Debug)]
pub struct PresenceConfig {
    /// Display name, defaults to the short peer id
    pub name: Option<String>,
    pub identity: Identity,
    pub heartbeat_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            name: None,
            identity: Identity::default(),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

/// Notifications for local consumers. Not replicated.
#[derive(Clone, Debug)]
pub enum PresenceEvent {
    PeerJoined(PeerInfo),
    PeerLeft(PeerId),
    Announced(Announce),
    PrivateMessage(PrivateMessage),
}

enum Command {
    MyState(oneshot::Sender<Option<PeerStateRecord>>),
    PeerState(PeerId, oneshot::Sender<Option<PeerStateRecord>>),
    AllPeers(oneshot::Sender<Vec<PeerStateRecord>>),
    SetPosition(Position, oneshot::Sender<PeerStateRecord>),
    SendPrivate {
        to: PeerId,
        content: String,
        reply: oneshot::Sender<Result<bool, PresenceError>>,
    },
}

/// Cloneable handle to a running orchestrator
#[derive(Clone)]
pub struct PresenceHandle {
    local_id: PeerId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<PresenceEvent>,
    transport: Arc<Transport>,
    cancel: CancellationToken,
}

impl PresenceHandle {
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Bound peer-connection address
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.transport.listen_addr()
    }

    /// Our own replicated record
    pub async fn my_state(&self) -> Result<Option<PeerStateRecord>, PresenceError> {
        self.request(Command::MyState).await
    }

    /// Replicated record of any known peer
    pub async fn peer_state(&self, id: &PeerId) -> Result<Option<PeerStateRecord>, PresenceError> {
        let id = id.clone();
        self.request(|reply| Command::PeerState(id, reply)).await
    }

    /// Every live record, ourselves included
    pub async fn all_peers(&self) -> Result<Vec<PeerStateRecord>, PresenceError> {
        self.request(Command::AllPeers).await
    }

    /// Peers with an open connection
    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        self.transport.connected_peers()
    }

    /// Move ourselves. Peers learn the new position from the next heartbeat.
    pub async fn set_local_position(&self, x: f64, y: f64) -> Result<PeerStateRecord, PresenceError> {
        if !x.is_finite() || !y.is_finite() {
            return Err(PresenceError::InvalidPosition { x, y });
        }
        self.request(|reply| Command::SetPosition(Position::new(x, y), reply))
            .await
    }

    /// Send a private message. `false` when the peer is not connected.
    pub async fn send_private(&self, to: &PeerId, content: impl Into<String>) -> Result<bool, PresenceError> {
        let to = to.clone();
        let content = content.into();
        self.request(|reply| Command::SendPrivate { to, content, reply })
            .await?
    }

    /// Subscribe to presence notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// Stop the orchestrator and its transport
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, PresenceError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| PresenceError::Stopped)?;
        rx.await.map_err(|_| PresenceError::Stopped)
    }
}

/// Owner of the replicated store
pub struct Orchestrator {
    local_id: PeerId,
    config: PresenceConfig,
    store: ReplicatedStore,
    /// Last record we wrote for ourselves
    local: PeerStateRecord,
    transport: Arc<Transport>,
    events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    metrics: Arc<dyn MetricsSource>,
    notify: broadcast::Sender<PresenceEvent>,
    /// Timestamp of the last heartbeat sent
    last_heartbeat: u64,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Start the transport and spawn the orchestrator task.
    ///
    /// Transport start failures are returned; nothing is left running.
    pub async fn start(
        keypair: KeyPair,
        transport_config: TransportConfig,
        config: PresenceConfig,
        metrics: Arc<dyn MetricsSource>,
        cancel: CancellationToken,
    ) -> Result<(PresenceHandle, JoinHandle<()>), PresenceError> {
        let (transport, events) = Transport::new(keypair, transport_config);
        let local_id = transport.start().await?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (notify, _) = broadcast::channel(EVENT_BUFFER);

        let handle = PresenceHandle {
            local_id,
            commands: command_tx,
            events: notify.clone(),
            transport: Arc::clone(&transport),
            cancel: cancel.clone(),
        };
        let orchestrator = Self::new(transport, events, command_rx, config, metrics, notify, cancel);
        let task = tokio::spawn(orchestrator.run());
        Ok((handle, task))
    }

    fn new(
        transport: Arc<Transport>,
        events: mpsc::Receiver<TransportEvent>,
        commands: mpsc::Receiver<Command>,
        config: PresenceConfig,
        metrics: Arc<dyn MetricsSource>,
        notify: broadcast::Sender<PresenceEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let local_id = transport.local_id().clone();
        let mut store = ReplicatedStore::new(local_id.clone());

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| local_id.short().to_string());
        let seed = PeerStatePatch::new()
            .name(name)
            .mood(metrics.mood())
            .identity(config.identity.clone());
        let local = store.set_local(&local_id, &seed);

        Self {
            local_id,
            config,
            store,
            local,
            transport,
            events,
            commands,
            metrics,
            notify,
            last_heartbeat: 0,
            cancel,
        }
    }

    /// Run until cancelled, then stop the transport
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Presence running as {} (heartbeat every {:?})",
            self.local_id, self.config.heartbeat_interval
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(event) = self.events.recv() => self.handle_transport_event(event),
                Some(command) = self.commands.recv() => self.handle_command(command),
                _ = ticker.tick() => self.tick(),
            }
        }

        self.transport.stop().await;
        info!("Presence stopped");
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected(info) => {
                info!("Peer joined: {} ({})", info.id, info.addr);
                self.send_catch_up(&info.id);
                self.publish(PresenceEvent::PeerJoined(info));
            }
            TransportEvent::PeerDisconnected(peer_id) => {
                info!("Peer left: {}", peer_id);
                self.store.remove(&peer_id);
                self.publish(PresenceEvent::PeerLeft(peer_id));
            }
            TransportEvent::MessageReceived { from, envelope } => match envelope.payload {
                Some(Payload::Heartbeat(heartbeat)) => self.apply_heartbeat(&from, heartbeat),
                Some(Payload::SyncDelta(delta)) => match self.store.apply_delta(&delta.update) {
                    Ok(changed) => {
                        debug!("Sync from {}: {} entries changed", from, changed);
                        self.reassert_local();
                    }
                    Err(e) => warn!("Rejected sync delta from {}: {}", from, e),
                },
                Some(Payload::Announce(announce)) => {
                    debug!("Announce from {}: {}", from, announce.name);
                    self.publish(PresenceEvent::Announced(announce));
                }
                Some(Payload::PrivateMessage(message)) => self.deliver_private(&from, message),
                None => debug!(
                    "Ignoring message of unknown kind from {} (version {})",
                    from, envelope.version
                ),
            },
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::MyState(reply) => {
                let _ = reply.send(self.store.get(&self.local_id).cloned());
            }
            Command::PeerState(id, reply) => {
                let _ = reply.send(self.store.get(&id).cloned());
            }
            Command::AllPeers(reply) => {
                let _ = reply.send(self.store.get_all());
            }
            Command::SetPosition(position, reply) => {
                let patch = PeerStatePatch::new().position(position);
                let record = self.write_local(&patch);
                debug!("Moved to ({}, {})", position.x, position.y);
                let _ = reply.send(record);
            }
            Command::SendPrivate { to, content, reply } => {
                let envelope = Envelope::private_message(self.local_id.clone(), to.clone(), content);
                let result = self.transport.send_to(&to, &envelope).map_err(|e| {
                    error!("Failed to send private message to {}: {}", to, e);
                    PresenceError::from(e)
                });
                let _ = reply.send(result);
            }
        }
    }

    /// Refresh our record from the metrics source and broadcast a heartbeat
    fn tick(&mut self) {
        let snapshot = self.metrics.snapshot();
        let mood = self.metrics.mood();

        let mut patch = PeerStatePatch::new().mood(mood);
        if let Some(hardware) = snapshot {
            patch = patch.hardware(hardware);
        }
        let record = self.write_local(&patch);

        let pruned = self.store.prune_tombstones();
        if pruned > 0 {
            debug!("Dropped {} expired tombstones", pruned);
        }

        let counter = self
            .store
            .stamp_of(&self.local_id)
            .map(|stamp| stamp.counter)
            .unwrap_or_else(now_millis);
        let timestamp = counter.max(self.last_heartbeat);
        self.last_heartbeat = timestamp;

        let load = LoadSample {
            cpu_usage: record.hardware.cpu_usage,
            ram_usage: record.hardware.ram_usage,
        };
        let heartbeat = Heartbeat::new(self.local_id.clone(), load, record.position, mood, timestamp);

        match self.transport.broadcast(&Envelope::heartbeat(heartbeat)) {
            Ok(sent) => info!(
                "Heartbeat ({} connected, {} known) | {} | CPU: {}%",
                sent,
                self.store.count(),
                mood,
                load.cpu_usage
            ),
            Err(e) => error!("Failed to broadcast heartbeat: {}", e),
        }
    }

    fn apply_heartbeat(&mut self, from: &PeerId, heartbeat: Heartbeat) {
        if heartbeat.peer_id != *from {
            warn!("Heartbeat from {} claims to be {}", from, heartbeat.peer_id);
            return;
        }

        let mut patch = PeerStatePatch::new()
            .position(heartbeat.position())
            .load(heartbeat.load());
        match heartbeat.parsed_mood() {
            Some(mood) => patch = patch.mood(mood),
            None => debug!("Unknown mood {:?} from {}", heartbeat.mood, from),
        }

        let stamp = Stamp::new(heartbeat.timestamp, from.clone());
        if self.store.set_remote(from, &patch, stamp) {
            debug!("Heartbeat from {}: CPU {}%", from, heartbeat.cpu_usage);
        } else {
            debug!("Ignored heartbeat from {} ({}): stale or ahead of our clock", from, heartbeat.timestamp);
        }
    }

    fn write_local(&mut self, patch: &PeerStatePatch) -> PeerStateRecord {
        let record = self.store.set_local(&self.local_id, patch);
        self.local = record.clone();
        record
    }

    /// A peer's delta can carry a tombstone or an older copy of our own
    /// record from a previous session. Ours is written back with a fresh
    /// stamp, which dominates everything merged so far.
    fn reassert_local(&mut self) {
        if self.store.get(&self.local_id) == Some(&self.local) {
            return;
        }
        info!("Sync replaced our own record, restoring it");
        let patch = PeerStatePatch::from(&self.local);
        self.write_local(&patch);
    }

    fn deliver_private(&self, from: &PeerId, message: PrivateMessage) {
        if message.from != *from {
            warn!("Private message from {} claims sender {}", from, message.from);
            return;
        }
        if message.to != self.local_id {
            debug!("Private message from {} addressed to {}", from, message.to);
            return;
        }
        info!("Private message from {}", from);
        self.publish(PresenceEvent::PrivateMessage(message));
    }

    /// Full state and identity for a newly connected peer
    fn send_catch_up(&self, peer_id: &PeerId) {
        let envelopes = [
            Envelope::sync(self.store.get_delta()),
            Envelope::announce(
                self.local_id.clone(),
                self.local.name.clone(),
                Some(self.config.identity.clone()),
            ),
        ];

        for envelope in &envelopes {
            match self.transport.send_to(peer_id, envelope) {
                Ok(true) => debug!("Sent {} to {}", envelope.kind_name(), peer_id),
                Ok(false) => debug!("{} gone before {} was queued", peer_id, envelope.kind_name()),
                Err(e) => error!("Failed to send {} to {}: {}", envelope.kind_name(), peer_id, e),
            }
        }
    }

    fn publish(&self, event: PresenceEvent) {
        // No subscribers is fine
        let _ = self.notify.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::StaticMetrics;
    use clawverse_core::{HardwareSnapshot, Mood};
    use clawverse_net::DiscoveryConfig;
    use std::future::Future;

    struct Offline {
        orchestrator: Orchestrator,
        notifications: broadcast::Receiver<PresenceEvent>,
        _commands: mpsc::Sender<Command>,
        _events: mpsc::Sender<TransportEvent>,
    }

    fn offline(metrics: StaticMetrics) -> Offline {
        offline_with(metrics, PresenceConfig::default())
    }

    fn offline_with(metrics: StaticMetrics, config: PresenceConfig) -> Offline {
        let (transport, _) = Transport::new(KeyPair::from_seed(&[7u8; 32]), TransportConfig::default());
        let (event_tx, event_rx) = mpsc::channel(8);
        let (command_tx, command_rx) = mpsc::channel(8);
        let (notify, notifications) = broadcast::channel(8);
        let orchestrator = Orchestrator::new(
            transport,
            event_rx,
            command_rx,
            config,
            Arc::new(metrics),
            notify,
            CancellationToken::new(),
        );
        Offline {
            orchestrator,
            notifications,
            _commands: command_tx,
            _events: event_tx,
        }
    }

    fn loaded(cpu_usage: f64) -> StaticMetrics {
        StaticMetrics(Some(HardwareSnapshot {
            cpu_usage,
            ram_usage: 40.0,
            ..Default::default()
        }))
    }

    fn heartbeat_from(peer: &PeerId, x: f64, mood: &str, timestamp: u64) -> TransportEvent {
        let mut heartbeat = Heartbeat::new(
            peer.clone(),
            LoadSample {
                cpu_usage: 50.0,
                ram_usage: 10.0,
            },
            Position::new(x, 0.0),
            Mood::Working,
            timestamp,
        );
        heartbeat.mood = mood.to_string();
        TransportEvent::MessageReceived {
            from: peer.clone(),
            envelope: Envelope::heartbeat(heartbeat),
        }
    }

    #[test]
    fn test_local_record_seeded() {
        let node = offline(StaticMetrics(None));
        let local_id = node.orchestrator.local_id.clone();
        let record = node.orchestrator.store.get(&local_id).unwrap();
        assert_eq!(record.name, local_id.short());
        assert_eq!(record.mood, Mood::Sleeping);
    }

    #[test]
    fn test_tick_timestamps_increase() {
        let mut node = offline(loaded(70.0));
        let mut previous = 0;
        for _ in 0..5 {
            node.orchestrator.tick();
            assert!(node.orchestrator.last_heartbeat > previous);
            previous = node.orchestrator.last_heartbeat;
        }

        let local_id = node.orchestrator.local_id.clone();
        let record = node.orchestrator.store.get(&local_id).unwrap();
        assert_eq!(record.mood, Mood::Busy);
        assert_eq!(record.hardware.ram_usage, 40.0);
        assert_eq!(
            node.orchestrator.store.stamp_of(&local_id).unwrap().counter,
            previous
        );
    }

    #[test]
    fn test_tick_without_metrics_sleeps() {
        let mut node = offline(StaticMetrics(None));
        node.orchestrator.tick();
        let local_id = node.orchestrator.local_id.clone();
        assert_eq!(
            node.orchestrator.store.get(&local_id).unwrap().mood,
            Mood::Sleeping
        );
    }

    #[test]
    fn test_heartbeat_updates_and_stale_ignored() {
        let mut node = offline(StaticMetrics(None));
        let peer = PeerId::new("b0b0b0b0b0b0b0b0");

        node.orchestrator
            .handle_transport_event(heartbeat_from(&peer, 1.0, "busy", 1_000));
        let record = node.orchestrator.store.get(&peer).unwrap().clone();
        assert_eq!(record.position, Position::new(1.0, 0.0));
        assert_eq!(record.mood, Mood::Busy);
        assert_eq!(record.hardware.cpu_usage, 50.0);

        node.orchestrator
            .handle_transport_event(heartbeat_from(&peer, 9.0, "idle", 500));
        assert_eq!(
            node.orchestrator.store.get(&peer).unwrap().position,
            Position::new(1.0, 0.0)
        );

        // Unknown mood keeps the previous one
        node.orchestrator
            .handle_transport_event(heartbeat_from(&peer, 2.0, "dancing", 2_000));
        let record = node.orchestrator.store.get(&peer).unwrap();
        assert_eq!(record.position, Position::new(2.0, 0.0));
        assert_eq!(record.mood, Mood::Busy);
    }

    #[test]
    fn test_spoofed_heartbeat_dropped() {
        let mut node = offline(StaticMetrics(None));
        let sender = PeerId::new("b0b0b0b0b0b0b0b0");
        let victim = PeerId::new("c0c0c0c0c0c0c0c0");

        let TransportEvent::MessageReceived { envelope, .. } = heartbeat_from(&victim, 1.0, "idle", 10) else {
            unreachable!()
        };
        node.orchestrator
            .handle_transport_event(TransportEvent::MessageReceived { from: sender, envelope });
        assert!(node.orchestrator.store.get(&victim).is_none());
    }

    #[test]
    fn test_disconnect_removes_only_that_peer() {
        let mut node = offline(StaticMetrics(None));
        let b = PeerId::new("b0b0b0b0b0b0b0b0");
        let c = PeerId::new("c0c0c0c0c0c0c0c0");
        node.orchestrator.handle_transport_event(heartbeat_from(&b, 1.0, "idle", 10));
        node.orchestrator.handle_transport_event(heartbeat_from(&c, 2.0, "idle", 10));
        assert_eq!(node.orchestrator.store.count(), 3);

        node.orchestrator
            .handle_transport_event(TransportEvent::PeerDisconnected(b.clone()));
        assert!(node.orchestrator.store.get(&b).is_none());
        assert!(node.orchestrator.store.get(&c).is_some());
        assert!(matches!(
            node.notifications.try_recv(),
            Ok(PresenceEvent::PeerLeft(id)) if id == b
        ));
    }

    #[test]
    fn test_sync_delta_merges_and_garbage_is_rejected() {
        let mut node = offline(StaticMetrics(None));
        let remote_id = PeerId::new("d0d0d0d0d0d0d0d0");
        let mut remote = ReplicatedStore::new(remote_id.clone());
        remote.set_local(&remote_id, &PeerStatePatch::new().name("dora"));

        node.orchestrator.handle_transport_event(TransportEvent::MessageReceived {
            from: remote_id.clone(),
            envelope: Envelope::sync(remote.get_delta()),
        });
        assert_eq!(node.orchestrator.store.get(&remote_id).unwrap().name, "dora");

        let before = node.orchestrator.store.get_all();
        node.orchestrator.handle_transport_event(TransportEvent::MessageReceived {
            from: remote_id,
            envelope: Envelope::sync(vec![0xff, 0x00, 0x13]),
        });
        assert_eq!(node.orchestrator.store.get_all(), before);
    }

    #[test]
    fn test_own_record_survives_tombstone_in_catch_up() {
        let config = PresenceConfig {
            name: Some("custom-name".to_string()),
            ..Default::default()
        };
        let mut node = offline_with(StaticMetrics(None), config);
        let me = node.orchestrator.local_id.clone();
        let (reply, _) = oneshot::channel();
        node.orchestrator
            .handle_command(Command::SetPosition(Position::new(5.0, 5.0), reply));

        // The peer knew us, then lost the link and tombstoned us
        let peer_id = PeerId::new("a1a1a1a1a1a1a1a1");
        let mut peer = ReplicatedStore::new(peer_id.clone());
        peer.apply_delta(&node.orchestrator.store.get_delta()).unwrap();
        assert!(peer.remove(&me));

        node.orchestrator.handle_transport_event(TransportEvent::MessageReceived {
            from: peer_id,
            envelope: Envelope::sync(peer.get_delta()),
        });

        let record = node.orchestrator.store.get(&me).unwrap();
        assert_eq!(record.name, "custom-name");
        assert_eq!(record.position, Position::new(5.0, 5.0));
        let stamp = node.orchestrator.store.stamp_of(&me).unwrap();
        assert_eq!(stamp.replica, me);
        assert!(stamp > peer.stamp_of(&me).unwrap());

        node.orchestrator.tick();
        let record = node.orchestrator.store.get(&me).unwrap();
        assert_eq!(record.name, "custom-name");
        assert_eq!(record.position, Position::new(5.0, 5.0));
    }

    #[test]
    fn test_private_message_only_for_us() {
        let mut node = offline(StaticMetrics(None));
        let local_id = node.orchestrator.local_id.clone();
        let sender = PeerId::new("e0e0e0e0e0e0e0e0");

        node.orchestrator.handle_transport_event(TransportEvent::MessageReceived {
            from: sender.clone(),
            envelope: Envelope::private_message(sender.clone(), PeerId::new("someone-else"), "psst"),
        });
        assert!(node.notifications.try_recv().is_err());

        node.orchestrator.handle_transport_event(TransportEvent::MessageReceived {
            from: sender.clone(),
            envelope: Envelope::private_message(sender.clone(), local_id, "hello"),
        });
        match node.notifications.try_recv() {
            Ok(PresenceEvent::PrivateMessage(message)) => {
                assert_eq!(message.from, sender);
                assert_eq!(message.content, "hello");
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[test]
    fn test_unknown_payload_is_ignored() {
        let mut node = offline(StaticMetrics(None));
        let before = node.orchestrator.store.get_all();
        node.orchestrator.handle_transport_event(TransportEvent::MessageReceived {
            from: PeerId::new("f0f0f0f0f0f0f0f0"),
            envelope: Envelope {
                version: 2,
                payload: None,
            },
        });
        assert_eq!(node.orchestrator.store.get_all(), before);
    }

    async fn node(seed: u8, bootstrap: Vec<SocketAddr>) -> (PresenceHandle, JoinHandle<()>) {
        let transport = TransportConfig {
            topic: "presence-test".to_string(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            discovery: DiscoveryConfig {
                multicast: false,
                bootstrap,
                interval: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        };
        let config = PresenceConfig {
            name: Some(format!("node-{seed}")),
            identity: Identity::default(),
            heartbeat_interval: Duration::from_millis(50),
        };
        Orchestrator::start(
            KeyPair::from_seed(&[seed; 32]),
            transport,
            config,
            Arc::new(loaded(10.0)),
            CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn test_two_nodes_converge_over_tcp() {
        let (a, a_task) = node(1, vec![]).await;
        let (b, b_task) = node(2, vec![a.listen_addr().unwrap()]).await;
        let mut b_events = b.subscribe();
        let a_id = a.local_id().clone();
        let b_id = b.local_id().clone();

        // Names only travel in sync deltas
        eventually("catch-up sync", || {
            let (a, b, a_id, b_id) = (a.clone(), b.clone(), a_id.clone(), b_id.clone());
            async move {
                let seen_by_b = b.peer_state(&a_id).await.unwrap();
                let seen_by_a = a.peer_state(&b_id).await.unwrap();
                matches!((seen_by_b, seen_by_a), (Some(x), Some(y)) if x.name == "node-1" && y.name == "node-2")
            }
        })
        .await;
        assert_eq!(a.connected_peers().len(), 1);

        a.set_local_position(3.0, 4.0).await.unwrap();
        eventually("heartbeat position", || {
            let (b, a_id) = (b.clone(), a_id.clone());
            async move {
                b.peer_state(&a_id)
                    .await
                    .unwrap()
                    .is_some_and(|record| record.position == Position::new(3.0, 4.0))
            }
        })
        .await;

        assert!(a.send_private(&b_id, "hi b").await.unwrap());
        assert!(!a.send_private(&PeerId::new("0000000000000000"), "anyone?").await.unwrap());
        let delivered = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(PresenceEvent::PrivateMessage(message)) = b_events.recv().await {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(delivered.content, "hi b");
        assert_eq!(delivered.from, a_id);

        a.shutdown();
        a_task.await.unwrap();
        assert!(matches!(a.my_state().await, Err(PresenceError::Stopped)));

        eventually("disconnect cleanup", || {
            let (b, a_id) = (b.clone(), a_id.clone());
            async move { b.peer_state(&a_id).await.unwrap().is_none() }
        })
        .await;
        assert!(b.my_state().await.unwrap().is_some());

        b.shutdown();
        b_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_position_rejected() {
        let (a, task) = node(3, vec![]).await;
        assert!(matches!(
            a.set_local_position(f64::NAN, 1.0).await,
            Err(PresenceError::InvalidPosition { .. })
        ));
        let record = a.set_local_position(-5.0, 12.5).await.unwrap();
        assert_eq!(record.position, Position::new(-5.0, 12.5));

        a.shutdown();
        task.await.unwrap();
    }
}

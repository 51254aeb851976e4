//! TCP transport layer
//!
//! Owns the listener, the discovery task and a reader/writer task pair per
//! connected peer. Everything the rest of the daemon learns about the mesh
//! arrives as [`TransportEvent`]s on a single channel.

use crate::crypto::KeyPair;
use crate::discovery::{Candidate, Discovery, DiscoveryConfig, DiscoveryError};
use crate::framing::{Frame, FrameCodec, FrameError, FrameType};
use crate::peer::{ConnectionState, Direction, PeerInfo};
use bytes::Bytes;
use clawverse_core::crypto::derive_discovery_key;
use clawverse_core::protocol::MIN_SUPPORTED_VERSION;
use clawverse_core::{now_millis, DiscoveryKey, Envelope, PeerId, PROTOCOL_VERSION};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

type PeerFramed = Framed<TcpStream, FrameCodec>;
type FrameSink = SplitSink<PeerFramed, Frame>;
type FrameStream = SplitStream<PeerFramed>;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] clawverse_core::Error),
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Connected to ourselves")]
    SelfConnection,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Transport already started")]
    AlreadyStarted,
    #[error("Timed out")]
    Timeout,
}

/// Transport configuration
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Topic shared by every peer of the mesh
    pub topic: String,
    /// TCP listen address
    pub listen_addr: SocketAddr,
    pub discovery: DiscoveryConfig,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    /// A connection with no inbound traffic for this long is closed
    pub idle_timeout: Duration,
    /// Per-peer outbound frame queue
    pub outbound_queue: usize,
    /// Capacity of the event channel
    pub event_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            topic: "clawverse-v1".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            discovery: DiscoveryConfig::default(),
            dial_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            outbound_queue: 256,
            event_queue: 1024,
        }
    }
}

/// Event from the transport layer
#[derive(Debug)]
pub enum TransportEvent {
    /// A session to the peer became current
    PeerConnected(PeerInfo),
    /// The peer's current session closed
    PeerDisconnected(PeerId),
    /// A decoded envelope arrived
    MessageReceived { from: PeerId, envelope: Envelope },
}

/// First frame on every connection, in both directions
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Hello {
    protocol_version: u32,
    discovery_key: DiscoveryKey,
    public_key: [u8; 32],
    listen_port: u16,
}

struct Session {
    id: u64,
    info: PeerInfo,
    /// Identifier of the side that opened the stream
    dialer: PeerId,
    last_seen: Arc<AtomicU64>,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

impl Session {
    fn snapshot(&self) -> PeerInfo {
        let mut info = self.info.clone();
        info.last_seen = self.last_seen.load(Ordering::Relaxed);
        info
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Registration {
    New,
    Replaced,
    Rejected,
}

/// Transport layer managing connections
pub struct Transport {
    keypair: KeyPair,
    local_id: PeerId,
    discovery_key: DiscoveryKey,
    config: TransportConfig,
    /// Current session per peer
    sessions: RwLock<HashMap<PeerId, Session>>,
    states: RwLock<HashMap<PeerId, ConnectionState>>,
    /// Addresses with a dial in flight
    dialing: Mutex<HashSet<SocketAddr>>,
    /// Who answered at a dialed address
    dialed: RwLock<HashMap<SocketAddr, PeerId>>,
    local_addr: RwLock<Option<SocketAddr>>,
    events: mpsc::Sender<TransportEvent>,
    next_session: AtomicU64,
    started: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Transport {
    /// Create a new transport and the receiving end of its event channel
    pub fn new(keypair: KeyPair, config: TransportConfig) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(config.event_queue.max(1));
        let transport = Self {
            local_id: keypair.peer_id(),
            discovery_key: derive_discovery_key(&config.topic),
            keypair,
            config,
            sessions: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
            dialed: RwLock::new(HashMap::new()),
            local_addr: RwLock::new(None),
            events,
            next_session: AtomicU64::new(1),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        (Arc::new(transport), rx)
    }

    /// Bind the listener and start discovery.
    ///
    /// Returns our peer identifier. Bind and multicast socket failures are
    /// returned to the caller.
    pub async fn start(self: &Arc<Self>) -> Result<PeerId, TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.write() = Some(local_addr);

        let discovery = Discovery::bind(
            self.config.discovery.clone(),
            self.discovery_key,
            &self.keypair,
            local_addr.port(),
        )?;
        let (candidate_tx, candidate_rx) = mpsc::channel(64);

        self.tasks
            .spawn(discovery.run(candidate_tx, self.cancel.child_token()));
        self.tasks.spawn(Arc::clone(self).accept_loop(listener));
        self.tasks.spawn(Arc::clone(self).dial_loop(candidate_rx));

        info!(
            "Transport {} listening on {} (topic key {})",
            self.local_id, local_addr, self.discovery_key
        );
        Ok(self.local_id.clone())
    }

    /// Close every connection and stop discovery. Safe to call twice.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        let drained: Vec<Session> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.cancel.cancel();
        }
        drop(drained);
        self.states.write().clear();
        self.dialing.lock().clear();

        self.tasks.close();
        self.tasks.wait().await;
        info!("Transport stopped");
    }

    /// Our peer ID
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Bound TCP address, once started
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Topic discovery key
    pub fn discovery_key(&self) -> &DiscoveryKey {
        &self.discovery_key
    }

    /// Connected peers, ordered by identifier
    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.sessions.read().values().map(Session::snapshot).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Number of connected peers
    pub fn peer_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Check if connected to a peer
    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Lifecycle state of a peer we have heard of
    pub fn connection_state(&self, id: &PeerId) -> Option<ConnectionState> {
        self.states.read().get(id).copied()
    }

    /// Queue an envelope to every connected peer.
    ///
    /// Encodes once. A peer whose queue is full or closed is skipped. Returns
    /// how many peers the envelope was queued for. Envelopes that do not fit
    /// in a frame are refused before anything is queued.
    pub fn broadcast(&self, envelope: &Envelope) -> Result<usize, TransportError> {
        let frame = message_frame(envelope)?;
        let sessions = self.sessions.read();
        let mut queued = 0;
        for (peer_id, session) in sessions.iter() {
            match session.tx.try_send(frame.clone()) {
                Ok(()) => queued += 1,
                Err(e) => warn!("Failed to queue {} for {}: {}", envelope.kind_name(), peer_id, e),
            }
        }
        Ok(queued)
    }

    /// Queue an envelope to one peer.
    ///
    /// `Ok(false)` when the peer is not connected or its queue is unavailable.
    pub fn send_to(&self, peer_id: &PeerId, envelope: &Envelope) -> Result<bool, TransportError> {
        let frame = message_frame(envelope)?;
        let sessions = self.sessions.read();
        let Some(session) = sessions.get(peer_id) else {
            debug!("Not connected to {}, dropping {}", peer_id, envelope.kind_name());
            return Ok(false);
        };
        match session.tx.try_send(frame) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Failed to queue {} for {}: {}", envelope.kind_name(), peer_id, e);
                Ok(false)
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let this = Arc::clone(&self);
                        self.tasks.spawn(async move {
                            let handshake = tokio::select! {
                                _ = this.cancel.cancelled() => return,
                                handshake = this.handshake(stream) => handshake,
                            };
                            match handshake {
                                Ok((framed, hello, peer_id)) => {
                                    this.run_session(framed, hello, peer_id, addr, Direction::Inbound).await;
                                }
                                Err(e) => debug!("Inbound handshake from {} failed: {}", addr, e),
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    async fn dial_loop(self: Arc<Self>, mut candidates: mpsc::Receiver<Candidate>) {
        loop {
            let candidate = tokio::select! {
                _ = self.cancel.cancelled() => break,
                candidate = candidates.recv() => match candidate {
                    Some(candidate) => candidate,
                    None => break,
                },
            };
            if self.should_dial(&candidate) {
                self.tasks.spawn(Arc::clone(&self).dial(candidate));
            }
        }
    }

    /// Decide whether a candidate needs a new outbound connection.
    ///
    /// Of two peers that see each other's beacons only the smaller identifier
    /// dials. Bootstrap addresses are dialed until someone answers there.
    fn should_dial(&self, candidate: &Candidate) -> bool {
        if let Some(id) = &candidate.peer_id {
            let mut states = self.states.write();
            let state = states.entry(id.clone()).or_insert(ConnectionState::Discovered);
            match *state {
                ConnectionState::Connecting | ConnectionState::Connected => return false,
                ConnectionState::Closed => *state = ConnectionState::Discovered,
                ConnectionState::Discovered => {}
            }
            if self.local_id >= *id {
                return false;
            }
        } else if let Some(known) = self.dialed.read().get(&candidate.addr) {
            if *known == self.local_id || self.sessions.read().contains_key(known) {
                return false;
            }
        }
        self.dialing.lock().insert(candidate.addr)
    }

    async fn dial(self: Arc<Self>, candidate: Candidate) {
        if let Some(id) = &candidate.peer_id {
            self.states.write().insert(id.clone(), ConnectionState::Connecting);
        }

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::ConnectionClosed),
            outcome = self.open(&candidate) => outcome,
        };
        self.dialing.lock().remove(&candidate.addr);

        match outcome {
            Ok((framed, hello, peer_id)) => {
                self.dialed.write().insert(candidate.addr, peer_id.clone());
                self.run_session(framed, hello, peer_id, candidate.addr, Direction::Outbound)
                    .await;
            }
            Err(TransportError::SelfConnection) => {
                debug!("{} is our own address", candidate.addr);
                self.dialed.write().insert(candidate.addr, self.local_id.clone());
            }
            Err(e) => {
                debug!("Dial {} failed: {}", candidate.addr, e);
                if let Some(id) = &candidate.peer_id {
                    let mut states = self.states.write();
                    if states.get(id) == Some(&ConnectionState::Connecting) {
                        states.insert(id.clone(), ConnectionState::Discovered);
                    }
                }
            }
        }
    }

    async fn open(&self, candidate: &Candidate) -> Result<(PeerFramed, Hello, PeerId), TransportError> {
        let stream = timeout(self.config.dial_timeout, TcpStream::connect(candidate.addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let (framed, hello, peer_id) = self.handshake(stream).await?;
        if let Some(expected) = &candidate.peer_id {
            if *expected != peer_id {
                return Err(TransportError::Handshake(format!(
                    "expected {} at {}, found {}",
                    expected, candidate.addr, peer_id
                )));
            }
        }
        Ok((framed, hello, peer_id))
    }

    /// Exchange hellos and check the remote belongs to our topic.
    async fn handshake(&self, stream: TcpStream) -> Result<(PeerFramed, Hello, PeerId), TransportError> {
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, FrameCodec::new());
        let hello = Hello {
            protocol_version: PROTOCOL_VERSION,
            discovery_key: self.discovery_key,
            public_key: self.keypair.public_key(),
            listen_port: self.listen_addr().map(|a| a.port()).unwrap_or(0),
        };

        let exchange = async {
            framed.send(Frame::control(FrameType::Hello, &hello)?).await?;
            match framed.next().await {
                Some(frame) => Ok::<_, TransportError>(frame?),
                None => Err(TransportError::ConnectionClosed),
            }
        };
        let frame = timeout(self.config.handshake_timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout)??;

        if frame.frame_type != FrameType::Hello {
            return Err(TransportError::Handshake(format!(
                "expected hello, got {:?}",
                frame.frame_type
            )));
        }
        let remote: Hello = frame.parse()?;
        if remote.protocol_version < MIN_SUPPORTED_VERSION {
            return Err(TransportError::Handshake(format!(
                "unsupported protocol version {}",
                remote.protocol_version
            )));
        }
        if remote.discovery_key != self.discovery_key {
            return Err(TransportError::Handshake("discovery key mismatch".to_string()));
        }
        let peer_id = PeerId::from_public_key(&remote.public_key);
        if peer_id == self.local_id {
            return Err(TransportError::SelfConnection);
        }
        Ok((framed, remote, peer_id))
    }

    async fn run_session(
        self: &Arc<Self>,
        framed: PeerFramed,
        hello: Hello,
        peer_id: PeerId,
        addr: SocketAddr,
        direction: Direction,
    ) {
        let dialer = match direction {
            Direction::Outbound => self.local_id.clone(),
            Direction::Inbound => peer_id.clone(),
        };
        let listen_addr = SocketAddr::new(addr.ip(), hello.listen_port);
        let info = PeerInfo::new(peer_id.clone(), addr, listen_addr, direction);
        let last_seen = Arc::new(AtomicU64::new(info.last_seen));
        let (tx, rx) = mpsc::channel(self.config.outbound_queue.max(1));
        let cancel = self.cancel.child_token();
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);

        let session = Session {
            id: session_id,
            info: info.clone(),
            dialer,
            last_seen: Arc::clone(&last_seen),
            tx,
            cancel: cancel.clone(),
        };
        match self.register(session) {
            Registration::Rejected => {
                debug!("Dropping duplicate session to {} ({:?})", peer_id, direction);
                return;
            }
            Registration::Replaced => debug!("Session to {} replaced ({:?})", peer_id, direction),
            Registration::New => info!("Peer {} connected ({:?}, {})", peer_id, direction, addr),
        }
        self.emit(TransportEvent::PeerConnected(info)).await;

        let (sink, stream) = framed.split();
        let keepalive = (self.config.idle_timeout / 3).max(Duration::from_millis(10));
        self.tasks
            .spawn(write_loop(sink, rx, cancel.clone(), keepalive));

        self.read_loop(&peer_id, stream, &last_seen, &cancel).await;
        cancel.cancel();
        self.unregister(&peer_id, session_id).await;
    }

    /// Make a session current for its peer.
    ///
    /// With two sessions for the same peer both ends keep the one opened by
    /// the smaller identifier; for the same dialer the newer one wins. A
    /// replacement is announced again as `PeerConnected` so the consumer can
    /// resend anything queued on the displaced session.
    fn register(&self, session: Session) -> Registration {
        let peer_id = session.info.id.clone();
        let mut sessions = self.sessions.write();
        if self.cancel.is_cancelled() {
            return Registration::Rejected;
        }
        let outcome = match sessions.get(&peer_id) {
            None => Registration::New,
            Some(existing) if session.dialer <= existing.dialer => Registration::Replaced,
            Some(_) => return Registration::Rejected,
        };
        if let Some(displaced) = sessions.insert(peer_id.clone(), session) {
            displaced.cancel.cancel();
        }
        drop(sessions);
        self.states.write().insert(peer_id, ConnectionState::Connected);
        outcome
    }

    /// Drop a session if it is still the current one for its peer.
    async fn unregister(&self, peer_id: &PeerId, session_id: u64) {
        let removed = {
            let mut sessions = self.sessions.write();
            match sessions.get(peer_id) {
                Some(current) if current.id == session_id => sessions.remove(peer_id).is_some(),
                _ => false,
            }
        };
        if removed {
            self.states.write().insert(peer_id.clone(), ConnectionState::Closed);
            info!("Peer {} disconnected", peer_id);
            self.emit(TransportEvent::PeerDisconnected(peer_id.clone())).await;
        }
    }

    async fn read_loop(
        &self,
        peer_id: &PeerId,
        mut stream: FrameStream,
        last_seen: &AtomicU64,
        cancel: &CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = timeout(self.config.idle_timeout, stream.next()) => next,
            };
            let frame = match next {
                Err(_) => {
                    debug!("Peer {} idle for {:?}", peer_id, self.config.idle_timeout);
                    return;
                }
                Ok(None) => {
                    debug!("Peer {} closed the stream", peer_id);
                    return;
                }
                Ok(Some(Err(e))) => {
                    warn!("Read from {} failed: {}", peer_id, e);
                    return;
                }
                Ok(Some(Ok(frame))) => frame,
            };
            last_seen.store(now_millis(), Ordering::Relaxed);

            match frame.frame_type {
                FrameType::Message => match Envelope::decode(&frame.payload) {
                    Ok(envelope) => {
                        debug!("Received {} from {}", envelope.kind_name(), peer_id);
                        self.emit(TransportEvent::MessageReceived {
                            from: peer_id.clone(),
                            envelope,
                        })
                        .await;
                    }
                    Err(e) => warn!("Dropping undecodable message from {}: {}", peer_id, e),
                },
                FrameType::Ping => {}
                FrameType::Hello => debug!("Ignoring repeated hello from {}", peer_id),
            }
        }
    }

    async fn emit(&self, event: TransportEvent) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.events.send(event) => {}
        }
    }
}

/// Encode an envelope into a frame the writer will accept
fn message_frame(envelope: &Envelope) -> Result<Frame, TransportError> {
    let frame = Frame::message(Bytes::from(envelope.encode()?));
    frame.checked_len()?;
    Ok(frame)
}

async fn write_loop(
    mut sink: FrameSink,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    keepalive: Duration,
) {
    let mut ticker = tokio::time::interval(keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ticker.tick() => Frame::ping(),
        };
        if let Err(e) = sink.send(frame).await {
            debug!("Write failed: {}", e);
            break;
        }
    }

    cancel.cancel();
    let _ = timeout(Duration::from_secs(1), sink.close()).await;
}

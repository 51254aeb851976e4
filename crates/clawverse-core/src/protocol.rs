//! Versioned wire protocol for peer-to-peer messages
//!
//! Wire format (postcard):
//! - varint u32: protocol version
//! - varint u32: payload kind (1 heartbeat, 2 sync delta, 3 announce, 4 private message)
//! - length-prefixed bytes: postcard encoding of the payload struct
//!
//! Payload kinds this build does not know decode to an envelope without a
//! payload. Bytes following the fields we know inside a payload are ignored, so
//! a later version may append fields without breaking older decoders. Existing
//! kinds and field positions must never be renumbered or reordered.

use crate::canonical::{canonical_bytes, ensure_finite, ensure_non_empty};
use crate::error::{Error, Result};
use crate::types::{Identity, LoadSample, Mood, PeerId, Position};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Version stamped on every envelope this build produces
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest version this build can decode
pub const MIN_SUPPORTED_VERSION: u32 = 1;

/// Periodic liveness and load beacon
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub peer_id: PeerId,
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub x: f64,
    pub y: f64,
    /// Mood name; unknown names are tolerated on decode
    pub mood: String,
    /// Unix millis
    pub timestamp: u64,
}

impl Heartbeat {
    pub fn new(peer_id: PeerId, load: LoadSample, position: Position, mood: Mood, timestamp: u64) -> Self {
        Self {
            peer_id,
            cpu_usage: load.cpu_usage,
            ram_usage: load.ram_usage,
            x: position.x,
            y: position.y,
            mood: mood.as_str().to_string(),
            timestamp,
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.x, self.y)
    }

    pub fn load(&self) -> LoadSample {
        LoadSample {
            cpu_usage: self.cpu_usage,
            ram_usage: self.ram_usage,
        }
    }

    /// Parsed mood, `None` for names this build does not know
    pub fn parsed_mood(&self) -> Option<Mood> {
        self.mood.parse().ok()
    }

    fn check_numbers(&self) -> Result<()> {
        ensure_finite("heartbeat.cpu_usage", self.cpu_usage)?;
        ensure_finite("heartbeat.ram_usage", self.ram_usage)?;
        ensure_finite("heartbeat.x", self.x)?;
        ensure_finite("heartbeat.y", self.y)
    }
}

/// Opaque replicated-state delta
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDelta {
    pub update: Vec<u8>,
}

/// Identity announcement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub peer_id: PeerId,
    pub name: String,
    pub identity: Option<Identity>,
}

/// Point-to-point text message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateMessage {
    pub from: PeerId,
    pub to: PeerId,
    pub content: String,
}

/// Closed set of payloads this build understands
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Heartbeat(Heartbeat),
    SyncDelta(SyncDelta),
    Announce(Announce),
    PrivateMessage(PrivateMessage),
}

/// Wire discriminant for [`Payload`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PayloadKind {
    Heartbeat = 1,
    SyncDelta = 2,
    Announce = 3,
    PrivateMessage = 4,
}

impl PayloadKind {
    /// `None` for kinds introduced by a later version
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Heartbeat),
            2 => Some(Self::SyncDelta),
            3 => Some(Self::Announce),
            4 => Some(Self::PrivateMessage),
            _ => None,
        }
    }
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Heartbeat(_) => PayloadKind::Heartbeat,
            Payload::SyncDelta(_) => PayloadKind::SyncDelta,
            Payload::Announce(_) => PayloadKind::Announce,
            Payload::PrivateMessage(_) => PayloadKind::PrivateMessage,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Payload::Heartbeat(_) => "heartbeat",
            Payload::SyncDelta(_) => "sync",
            Payload::Announce(_) => "announce",
            Payload::PrivateMessage(_) => "private",
        }
    }

    /// Schema checks applied before encoding.
    pub fn validate(&self) -> Result<()> {
        match self {
            Payload::Heartbeat(hb) => {
                ensure_non_empty("heartbeat.peer_id", hb.peer_id.as_str())?;
                hb.check_numbers()?;
                hb.mood.parse::<Mood>().map(|_| ())
            }
            Payload::SyncDelta(delta) => {
                if delta.update.is_empty() {
                    return Err(Error::Validation("missing required field: sync.update".into()));
                }
                Ok(())
            }
            Payload::Announce(announce) => ensure_non_empty("announce.peer_id", announce.peer_id.as_str()),
            Payload::PrivateMessage(msg) => {
                ensure_non_empty("private.from", msg.from.as_str())?;
                ensure_non_empty("private.to", msg.to.as_str())
            }
        }
    }

    fn body_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Payload::Heartbeat(hb) => canonical_bytes(hb),
            Payload::SyncDelta(delta) => canonical_bytes(delta),
            Payload::Announce(announce) => canonical_bytes(announce),
            Payload::PrivateMessage(msg) => canonical_bytes(msg),
        }
    }

    fn from_body(kind: PayloadKind, body: &[u8]) -> Result<Self> {
        let payload = match kind {
            PayloadKind::Heartbeat => {
                let hb: Heartbeat = take_body(body)?;
                hb.check_numbers()
                    .map_err(|e| Error::Decode(e.to_string()))?;
                Payload::Heartbeat(hb)
            }
            PayloadKind::SyncDelta => Payload::SyncDelta(take_body(body)?),
            PayloadKind::Announce => Payload::Announce(take_body(body)?),
            PayloadKind::PrivateMessage => Payload::PrivateMessage(take_body(body)?),
        };
        Ok(payload)
    }
}

fn take_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    postcard::take_from_bytes::<T>(body)
        .map(|(value, _newer_fields)| value)
        .map_err(|e| Error::Decode(e.to_string()))
}

/// Outermost wire structure
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    version: u32,
    kind: u32,
    body: Vec<u8>,
}

/// Versioned message wrapping at most one payload
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub version: u32,
    /// `None` only for payload kinds this build does not know
    pub payload: Option<Payload>,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: Some(payload),
        }
    }

    pub fn heartbeat(heartbeat: Heartbeat) -> Self {
        Self::new(Payload::Heartbeat(heartbeat))
    }

    pub fn sync(update: Vec<u8>) -> Self {
        Self::new(Payload::SyncDelta(SyncDelta { update }))
    }

    pub fn announce(peer_id: PeerId, name: impl Into<String>, identity: Option<Identity>) -> Self {
        Self::new(Payload::Announce(Announce {
            peer_id,
            name: name.into(),
            identity,
        }))
    }

    pub fn private_message(from: PeerId, to: PeerId, content: impl Into<String>) -> Self {
        Self::new(Payload::PrivateMessage(PrivateMessage {
            from,
            to,
            content: content.into(),
        }))
    }

    /// Payload name for logging
    pub fn kind_name(&self) -> &'static str {
        self.payload.as_ref().map(Payload::name).unwrap_or("unknown")
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Encode an envelope, validating it against the schema first.
///
/// A validation failure means the caller built a malformed message.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    if envelope.version < MIN_SUPPORTED_VERSION {
        return Err(Error::Validation(format!(
            "invalid protocol version: {}",
            envelope.version
        )));
    }
    let payload = envelope
        .payload
        .as_ref()
        .ok_or_else(|| Error::Validation("missing required field: payload".into()))?;
    payload.validate()?;

    let wire = WireEnvelope {
        version: envelope.version,
        kind: payload.kind() as u32,
        body: payload.body_bytes()?,
    };
    canonical_bytes(&wire)
}

/// Decode an envelope. Never panics on adversarial input.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let wire: WireEnvelope =
        postcard::from_bytes(bytes).map_err(|e| Error::Decode(e.to_string()))?;

    if wire.version < MIN_SUPPORTED_VERSION {
        return Err(Error::UnsupportedVersion(wire.version));
    }

    let payload = match PayloadKind::from_wire(wire.kind) {
        Some(kind) => Some(Payload::from_body(kind, &wire.body)?),
        None => None,
    };

    Ok(Envelope {
        version: wire.version,
        payload,
    })
}

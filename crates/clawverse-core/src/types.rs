//! Core data model for the Clawverse presence mesh
//!
//! Everything here is replicated or sent over the wire, so all types derive
//! serde. Field order matters for the postcard encoding.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of hex characters in a peer identifier (8 bytes of key material)
pub const PEER_ID_HEX_LEN: usize = 16;

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// IDENTITY TYPES
// =============================================================================

/// Peer identifier: hex prefix of the peer's transport public key
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an existing identifier string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive from a 32-byte public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(hex::encode(&public_key[..PEER_ID_HEX_LEN / 2]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First eight characters, used as the default display name
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Rendezvous key: SHA-256 of the topic string. Never sent as application data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryKey(pub [u8; 32]);

impl DiscoveryKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// =============================================================================
// PEER STATE
// =============================================================================

/// Position on the shared 2D map
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Coarse activity level, derived from CPU load
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    #[default]
    Idle,
    Working,
    Busy,
    Stressed,
    Sleeping,
}

impl Mood {
    pub const ALL: [Mood; 5] = [
        Mood::Idle,
        Mood::Working,
        Mood::Busy,
        Mood::Stressed,
        Mood::Sleeping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Idle => "idle",
            Mood::Working => "working",
            Mood::Busy => "busy",
            Mood::Stressed => "stressed",
            Mood::Sleeping => "sleeping",
        }
    }

    /// Map a CPU usage percentage to a mood.
    pub fn from_cpu(cpu_usage: f64) -> Self {
        if cpu_usage < 20.0 {
            Mood::Idle
        } else if cpu_usage < 60.0 {
            Mood::Working
        } else if cpu_usage < 80.0 {
            Mood::Busy
        } else {
            Mood::Stressed
        }
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mood {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mood::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown mood: {s:?}")))
    }
}

/// Host hardware snapshot. Scalar fields only; replicated as a unit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareSnapshot {
    /// 0-100
    pub cpu_usage: f64,
    /// 0-100
    pub ram_usage: f64,
    /// GB
    pub ram_total: f64,
    /// GB
    pub disk_free: f64,
    /// Seconds
    pub uptime: u64,
    pub platform: String,
    pub hostname: String,
    pub cpu_model: String,
    pub cpu_cores: u32,
}

/// CPU and RAM load carried by heartbeats
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSample {
    pub cpu_usage: f64,
    pub ram_usage: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Archetype {
    Warrior,
    Artisan,
    #[default]
    Scholar,
    Ranger,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelTrait {
    Poet,
    Engineer,
    Polymath,
    Hermit,
    #[default]
    Unknown,
}

/// Visual descriptor for rendering a peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appearance {
    pub form: String,
    pub primary_color: String,
    pub secondary_color: String,
    pub accessories: Vec<String>,
}

impl Default for Appearance {
    fn default() -> Self {
        Self {
            form: "octopus".into(),
            primary_color: "#888888".into(),
            secondary_color: "#444444".into(),
            accessories: Vec::new(),
        }
    }
}

/// Identity and appearance descriptor
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub archetype: Archetype,
    pub model_trait: ModelTrait,
    pub badges: Vec<String>,
    pub persona: String,
    pub appearance: Appearance,
}

/// Replicated state for a single peer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStateRecord {
    /// Immutable once created
    pub id: PeerId,
    pub name: String,
    pub position: Position,
    pub mood: Mood,
    pub hardware: HardwareSnapshot,
    pub identity: Identity,
    /// Unix millis of the last write
    pub last_update: u64,
}

impl PeerStateRecord {
    /// Record with every field at its default value
    pub fn with_defaults(id: PeerId) -> Self {
        Self {
            name: id.short().to_string(),
            id,
            position: Position::default(),
            mood: Mood::default(),
            hardware: HardwareSnapshot::default(),
            identity: Identity::default(),
            last_update: 0,
        }
    }
}

/// Partial update to a [`PeerStateRecord`]. `None` keeps the prior value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PeerStatePatch {
    pub name: Option<String>,
    pub position: Option<Position>,
    pub mood: Option<Mood>,
    pub hardware: Option<HardwareSnapshot>,
    /// Applied after `hardware`, overriding only cpu/ram usage
    pub load: Option<LoadSample>,
    pub identity: Option<Identity>,
}

impl From<&PeerStateRecord> for PeerStatePatch {
    /// Patch that rewrites every field of `record`
    fn from(record: &PeerStateRecord) -> Self {
        Self::new()
            .name(record.name.clone())
            .position(record.position)
            .mood(record.mood)
            .hardware(record.hardware.clone())
            .identity(record.identity.clone())
    }
}

impl PeerStatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn mood(mut self, mood: Mood) -> Self {
        self.mood = Some(mood);
        self
    }

    pub fn hardware(mut self, hardware: HardwareSnapshot) -> Self {
        self.hardware = Some(hardware);
        self
    }

    pub fn load(mut self, load: LoadSample) -> Self {
        self.load = Some(load);
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Fill from `existing` (or defaults for `id`), overlay this patch, and
    /// stamp `last_update`. The result always carries `id`.
    pub fn apply(&self, id: &PeerId, existing: Option<&PeerStateRecord>, now: u64) -> PeerStateRecord {
        let mut record = existing
            .cloned()
            .unwrap_or_else(|| PeerStateRecord::with_defaults(id.clone()));
        record.id = id.clone();

        if let Some(name) = &self.name {
            record.name = name.clone();
        }
        if let Some(position) = self.position {
            record.position = position;
        }
        if let Some(mood) = self.mood {
            record.mood = mood;
        }
        if let Some(hardware) = &self.hardware {
            record.hardware = hardware.clone();
        }
        if let Some(load) = self.load {
            record.hardware.cpu_usage = load.cpu_usage;
            record.hardware.ram_usage = load.ram_usage;
        }
        if let Some(identity) = &self.identity {
            record.identity = identity.clone();
        }
        record.last_update = now;
        record
    }
}

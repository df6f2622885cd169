use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Unique, administrator-chosen name of a storage peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerName(pub String);

impl PeerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle of a peer's connection as seen by the master.
///
/// Only `Available` peers take part in selection. `Degraded` means the
/// connection went quiet and a keepalive ping is outstanding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Handshaking,
    Available,
    Degraded,
    Offline,
}

impl PeerState {
    /// True when a connection is up, whether or not the peer is selectable.
    pub fn is_connected(self) -> bool {
        matches!(self, PeerState::Available | PeerState::Degraded)
    }
}

/// Direction of a transfer relative to the peer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The peer receives a file (client upload).
    Store,
    /// The peer sends a file (client download).
    Retrieve,
}

/// Disk usage reported by a peer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskStatus {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

/// Persistent definition of a peer, as registered by an administrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerDefinition {
    pub name: PeerName,
    pub endpoint: String,
    #[serde(default)]
    pub credentials: Option<String>,
    /// Free-form per-peer settings (`priority`, `max_errors`, `timeout_secs`, ...).
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl PeerDefinition {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: PeerName::new(name),
            endpoint: endpoint.into(),
            credentials: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn property<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.properties.get(key).and_then(|v| v.parse().ok())
    }
}

/// Thresholds used to classify a peer's health.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSettings {
    /// Length of the rolling error window.
    pub error_window: Duration,
    /// Errors tolerated inside the window; one more takes the peer offline.
    pub max_errors: usize,
    /// Silence after which the connection is declared dead.
    pub response_timeout: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            error_window: Duration::from_secs(60),
            max_errors: 5,
            response_timeout: Duration::from_secs(60),
        }
    }
}

impl HealthSettings {
    /// Applies the per-peer overrides carried in a definition's properties.
    pub fn for_peer(&self, def: &PeerDefinition) -> Self {
        let mut settings = *self;
        if let Some(max) = def.property::<usize>("max_errors") {
            settings.max_errors = max;
        }
        if let Some(secs) = def.property::<u64>("error_window_secs").filter(|s| *s > 0) {
            settings.error_window = Duration::from_secs(secs);
        }
        if let Some(secs) = def.property::<u64>("timeout_secs").filter(|s| *s > 0) {
            settings.response_timeout = Duration::from_secs(secs);
        }
        settings
    }

    /// Silence after which a keepalive ping is sent.
    pub fn keepalive(&self) -> Duration {
        self.response_timeout / 2
    }
}

/// A state transition observable by the selection engine and the client layer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub peer: PeerName,
    pub from: PeerState,
    pub to: PeerState,
    pub reason: String,
}

/// Snapshot of a peer for diagnostics and the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub name: PeerName,
    pub endpoint: String,
    pub state: PeerState,
    pub remerging: bool,
    pub disk: Option<DiskStatus>,
    pub active_transfers: usize,
    pub recent_errors: usize,
    pub extensions: Vec<String>,
}

//! Error types shared across the coordination layer.
//!
//! Transport and handshake failures are fatal to a single connection attempt,
//! never to the peer's registry entry. `PeerUnavailable` is what every RPC caller
//! sees once a peer drops or a single call times out.

use crate::peer::types::PeerName;
use crate::protocol::envelope::RemoteError;
use thiserror::Error;

/// Failures of the peer connection layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PeerError {
    #[error("could not connect to peer {peer}: {reason}")]
    ConnectError { peer: PeerName, reason: String },

    #[error("handshake with peer {peer} failed: {reason}")]
    HandshakeError { peer: PeerName, reason: String },

    #[error("peer {peer} is unavailable: {reason}")]
    PeerUnavailable { peer: PeerName, reason: String },

    #[error("peer {0} is not registered")]
    UnknownPeer(PeerName),

    #[error("peer {0} is already registered")]
    AlreadyExists(PeerName),

    #[error("peer {0} is already online")]
    AlreadyOnline(PeerName),
}

impl PeerError {
    pub fn unavailable(peer: &PeerName, reason: impl Into<String>) -> Self {
        PeerError::PeerUnavailable {
            peer: peer.clone(),
            reason: reason.into(),
        }
    }
}

/// Failures of the indexed request/response exchange.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("command {command} issued before the handshake completed")]
    HandshakeIncomplete { command: String },

    #[error("no outstanding request with index {0}")]
    UnknownIndex(u32),

    #[error("protocol extension {0} was not negotiated with this peer")]
    ExtensionNotNegotiated(String),

    #[error("unexpected response to {command}: {detail}")]
    UnexpectedResponse { command: String, detail: String },

    #[error("remote failure: {0}")]
    Remote(RemoteError),

    #[error(transparent)]
    Peer(#[from] PeerError),
}

impl RpcError {
    /// True when the failure means the peer can no longer be used for this call.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RpcError::Peer(PeerError::PeerUnavailable { .. }))
    }
}

/// Why a selection decision produced no candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoPeerReason {
    /// Nothing was available before any filter ran.
    NoPeersOnline,
    /// Filters eliminated every candidate.
    AllEliminated,
    /// The target file does not exist in the namespace.
    FileNotFound,
    /// The file exists but none of its owners are available.
    NoOwnersOnline,
}

impl std::fmt::Display for NoPeerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            NoPeerReason::NoPeersOnline => "no peers online",
            NoPeerReason::AllEliminated => "all candidates eliminated by filters",
            NoPeerReason::FileNotFound => "file not found",
            NoPeerReason::NoOwnersOnline => "no owner of the file is online",
        };
        f.write_str(text)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectionError {
    #[error("no available peer: {reason}")]
    NoAvailablePeer { reason: NoPeerReason },
}

impl SelectionError {
    pub fn reason(&self) -> NoPeerReason {
        match self {
            SelectionError::NoAvailablePeer { reason } => *reason,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NamespaceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} is not a directory")]
    NotADirectory(String),

    #[error("{0} is not a file")]
    NotAFile(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown filter: {0}")]
    UnknownFilter(String),

    #[error("filter {filter}: missing parameter {param}")]
    MissingParameter { filter: String, param: String },

    #[error("filter {filter}: bad value for {param}: {value}")]
    BadParameter {
        filter: String,
        param: String,
        value: String,
    },

    #[error("unknown selection chain: {0}")]
    UnknownChain(String),
}

/// Anything the coordinator façade can fail with.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinatorError {
    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Namespace(#[from] NamespaceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

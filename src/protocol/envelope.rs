//! Wire envelopes exchanged between the master and a storage peer.
//!
//! Every frame is a bincode-encoded value (see `codec`). The master writes a
//! `HandshakeRequest` once, then only `CommandEnvelope`s. The peer answers the
//! handshake with a `HandshakeResponse`, then writes `PeerMessage`s: correlated
//! responses plus unsolicited disk-status and listing frames.

use crate::peer::types::{DiskStatus, PeerName};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation token matching a response to the command that caused it.
pub type CorrelationIndex = u32;

/// First frame written by the master: who it expects and which extensions it
/// has loaded, in load order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeRequest {
    pub peer: PeerName,
    pub credentials: Option<String>,
    pub extensions: Vec<String>,
}

/// Success/failure wrapper returned by the peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeResponse {
    pub success: bool,
    pub failure: Option<String>,
}

impl HandshakeResponse {
    pub fn accepted() -> Self {
        Self {
            success: true,
            failure: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            failure: Some(reason.into()),
        }
    }
}

/// A request sent to a peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandEnvelope {
    pub index: CorrelationIndex,
    pub command: String,
    pub args: Vec<String>,
}

/// Typed success payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ResponseBody {
    Empty,
    Pong,
    Checksum(u64),
    DiskStatus(DiskStatus),
    Text(String),
    TransferStatus(TransferStatus),
}

impl ResponseBody {
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseBody::Empty => "empty",
            ResponseBody::Pong => "pong",
            ResponseBody::Checksum(_) => "checksum",
            ResponseBody::DiskStatus(_) => "disk-status",
            ResponseBody::Text(_) => "text",
            ResponseBody::TransferStatus(_) => "transfer-status",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferStatus {
    pub transfer_id: String,
    pub transferred: u64,
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// A local I/O failure on the peer. The connection stays usable.
    Io,
    /// The target path does not exist on the peer.
    NotFound,
    /// The peer does not know the command.
    Unsupported,
    /// Anything else; the master cannot trust the connection afterwards.
    Internal,
}

/// Exception payload carried in a response instead of a success body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Io, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    /// Errors the caller can handle without distrusting the connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::Io | RemoteErrorKind::NotFound | RemoteErrorKind::Unsupported
        )
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Response to a `CommandEnvelope` with the same index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    pub index: CorrelationIndex,
    pub outcome: Result<ResponseBody, RemoteError>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One immediate child of a listed directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildRecord {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Zero when the peer has not computed it.
    pub checksum: u64,
    /// Milliseconds since the Unix epoch.
    pub modified: u64,
}

impl ChildRecord {
    pub fn file(name: impl Into<String>, size: u64, checksum: u64, modified: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            size,
            checksum,
            modified,
        }
    }

    pub fn directory(name: impl Into<String>, modified: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            size: 0,
            checksum: 0,
            modified,
        }
    }
}

/// Recursive listing, streamed one directory at a time.
///
/// A directory is `Directory`, zero or more `Child`, then `EndOfDirectory`.
/// `Complete` closes the whole listing for the requested root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ListingFrame {
    Directory { path: String },
    Child(ChildRecord),
    EndOfDirectory,
    Complete { root: String },
}

/// Everything a peer writes after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PeerMessage {
    Response(ResponseEnvelope),
    DiskStatus(DiskStatus),
    Listing(ListingFrame),
}

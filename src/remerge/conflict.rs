//! Metadata conflicts between the namespace and a peer's listing.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::namespace::types::FileMeta;
use crate::peer::types::PeerName;
use crate::protocol::envelope::{ChildRecord, EntryKind};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConflictKind {
    /// Same path, same type, different size or checksum.
    ContentMismatch,
    /// A file on one side, a directory on the other.
    TypeMismatch,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Resolution {
    TookReported,
    KeptExisting,
}

/// A mismatch found while reconciling. Logged and reported, never an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationConflict {
    pub path: String,
    pub peer: PeerName,
    pub kind: ConflictKind,
    pub existing: EntryKind,
    pub existing_size: u64,
    pub existing_checksum: u64,
    pub reported: EntryKind,
    pub reported_size: u64,
    pub reported_checksum: u64,
    pub resolution: Resolution,
}

impl ReconciliationConflict {
    pub(crate) fn content(
        path: String,
        peer: &PeerName,
        existing: &FileMeta,
        reported: &ChildRecord,
        resolution: Resolution,
    ) -> Self {
        Self {
            path,
            peer: peer.clone(),
            kind: ConflictKind::ContentMismatch,
            existing: EntryKind::File,
            existing_size: existing.size,
            existing_checksum: existing.checksum,
            reported: EntryKind::File,
            reported_size: reported.size,
            reported_checksum: reported.checksum,
            resolution,
        }
    }

    pub(crate) fn types(
        path: String,
        peer: &PeerName,
        existing: EntryKind,
        reported: &ChildRecord,
        resolution: Resolution,
    ) -> Self {
        Self {
            path,
            peer: peer.clone(),
            kind: ConflictKind::TypeMismatch,
            existing,
            existing_size: 0,
            existing_checksum: 0,
            reported: reported.kind,
            reported_size: reported.size,
            reported_checksum: reported.checksum,
            resolution,
        }
    }

    pub(crate) fn log(&self) {
        tracing::warn!(
            path = %self.path,
            peer = %self.peer,
            kind = ?self.kind,
            existing_size = self.existing_size,
            existing_checksum = self.existing_checksum,
            reported_size = self.reported_size,
            reported_checksum = self.reported_checksum,
            resolution = ?self.resolution,
            "Reconciliation conflict"
        );
    }
}

/// Decides which side wins when a peer reports different content for a file
/// the namespace already knows.
pub trait ConflictResolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(
        &self,
        path: &str,
        existing: &FileMeta,
        reported: &ChildRecord,
        peer: &PeerName,
    ) -> Resolution;
}

/// The peer that reported most recently wins; owners holding the old content
/// are dropped.
#[derive(Debug, Default)]
pub struct LastWriterWins;

impl ConflictResolver for LastWriterWins {
    fn name(&self) -> &'static str {
        "last-writer-wins"
    }

    fn resolve(&self, _: &str, _: &FileMeta, _: &ChildRecord, _: &PeerName) -> Resolution {
        Resolution::TookReported
    }
}

/// The recorded metadata wins; the reporting peer is not counted as an owner.
#[derive(Debug, Default)]
pub struct KeepExisting;

impl ConflictResolver for KeepExisting {
    fn name(&self) -> &'static str {
        "keep-existing"
    }

    fn resolve(&self, _: &str, _: &FileMeta, _: &ChildRecord, _: &PeerName) -> Resolution {
        Resolution::KeptExisting
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    #[default]
    LastWriterWins,
    KeepExisting,
}

impl ConflictPolicy {
    pub fn resolver(self) -> Arc<dyn ConflictResolver> {
        match self {
            ConflictPolicy::LastWriterWins => Arc::new(LastWriterWins),
            ConflictPolicy::KeepExisting => Arc::new(KeepExisting),
        }
    }
}

impl std::str::FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last-writer-wins" => Ok(ConflictPolicy::LastWriterWins),
            "keep-existing" => Ok(ConflictPolicy::KeepExisting),
            other => Err(format!("unknown conflict policy: {}", other)),
        }
    }
}

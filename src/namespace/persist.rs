//! Durable copy of the master's state.
//!
//! The snapshot is a cache: a fresh remerge from every peer rebuilds
//! ownership on its own, so a missing or unreadable snapshot only costs
//! startup time.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

use super::types::NamespaceSnapshot;
use crate::peer::remote::now_ms;
use crate::peer::types::PeerDefinition;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MasterSnapshot {
    pub version: u32,
    pub saved_at: u64,
    pub peers: Vec<PeerDefinition>,
    pub namespace: NamespaceSnapshot,
}

impl MasterSnapshot {
    pub fn new(peers: Vec<PeerDefinition>, namespace: NamespaceSnapshot) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: now_ms(),
            peers,
            namespace,
        }
    }
}

/// Writes the snapshot next to its final location, then renames it in place.
pub async fn save_snapshot(path: &Path, snapshot: &MasterSnapshot) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).await?;
    }
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, &bytes).await?;
    fs::rename(&temp_path, path).await?;

    info!(
        peers = snapshot.peers.len(),
        entries = snapshot.namespace.entries.len(),
        size_bytes = bytes.len(),
        "Saved master snapshot to {}",
        path.display()
    );
    Ok(())
}

/// `Ok(None)` when there is nothing usable on disk.
pub async fn load_snapshot(path: &Path) -> Result<Option<MasterSnapshot>> {
    if !fs::try_exists(path).await? {
        return Ok(None);
    }
    let bytes = fs::read(path).await?;
    let snapshot: MasterSnapshot = match serde_json::from_slice(&bytes) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Ignoring unreadable snapshot {}: {}", path.display(), e);
            return Ok(None);
        }
    };
    if snapshot.version != SNAPSHOT_VERSION {
        warn!(
            found = snapshot.version,
            expected = SNAPSHOT_VERSION,
            "Ignoring snapshot with unknown version"
        );
        return Ok(None);
    }

    info!(
        peers = snapshot.peers.len(),
        entries = snapshot.namespace.entries.len(),
        "Loaded master snapshot from {}",
        path.display()
    );
    Ok(Some(snapshot))
}

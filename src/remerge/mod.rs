//! Remerge Module
//!
//! Converges the namespace with what a peer actually holds on disk.
//!
//! ## Core Mechanisms
//! - **Directory-at-a-time**: the peer streams its listing one directory at a
//!   time and each directory is merged atomically on its own lock, so an
//!   interrupted stream leaves every merged directory valid.
//! - **Ownership convergence**: entries the peer no longer reports lose it as
//!   an owner and disappear with their last owner.
//! - **Conflicts**: content mismatches go through a pluggable
//!   `ConflictResolver` (last writer wins by default) and are logged.
//! - **Flow control**: the peer's stream is paused while the unprocessed
//!   backlog is above a threshold.

pub mod conflict;
pub mod merge;
pub mod session;

use serde::{Deserialize, Serialize};

use conflict::ConflictPolicy;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemergeSettings {
    /// Backlog above which the peer is asked to pause its listing.
    pub pause_threshold: usize,
    /// Backlog at or below which a paused stream is resumed.
    pub resume_threshold: usize,
    pub conflict: ConflictPolicy,
}

impl Default for RemergeSettings {
    fn default() -> Self {
        Self {
            pause_threshold: 250,
            resume_threshold: 50,
            conflict: ConflictPolicy::LastWriterWins,
        }
    }
}

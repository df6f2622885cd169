use std::collections::BTreeMap;
use std::sync::Arc;

use crate::peer::remote::RemotePeer;
use crate::peer::types::PeerName;

#[derive(Debug, Clone)]
pub struct ScoredPeer {
    pub peer: Arc<RemotePeer>,
    pub score: i64,
}

impl ScoredPeer {
    pub fn name(&self) -> &PeerName {
        self.peer.name()
    }
}

/// Candidates of one selection decision and their scores.
///
/// The candidate set is fixed at construction: filters can change scores and
/// remove candidates, nothing can add one back.
#[derive(Debug)]
pub struct ScoreChart {
    entries: BTreeMap<PeerName, ScoredPeer>,
}

impl ScoreChart {
    pub fn new(peers: impl IntoIterator<Item = Arc<RemotePeer>>) -> Self {
        let entries = peers
            .into_iter()
            .map(|peer| (peer.name().clone(), ScoredPeer { peer, score: 0 }))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &PeerName) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &PeerName) -> Option<&ScoredPeer> {
        self.entries.get(name)
    }

    /// Remaining candidates in name order.
    pub fn candidates(&self) -> impl Iterator<Item = &ScoredPeer> {
        self.entries.values()
    }

    pub fn peers(&self) -> Vec<Arc<RemotePeer>> {
        self.entries.values().map(|e| e.peer.clone()).collect()
    }

    pub fn add_score(&mut self, name: &PeerName, delta: i64) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.score = entry.score.saturating_add(delta);
        }
    }

    /// Adjusts every remaining candidate by what `f` returns for it.
    pub fn score_each(&mut self, mut f: impl FnMut(&ScoredPeer) -> i64) {
        for entry in self.entries.values_mut() {
            let delta = f(entry);
            entry.score = entry.score.saturating_add(delta);
        }
    }

    pub fn remove(&mut self, name: &PeerName, reason: &str) -> bool {
        let removed = self.entries.remove(name).is_some();
        if removed {
            tracing::debug!("Eliminated {}: {}", name, reason);
        }
        removed
    }

    /// Keeps the candidates for which `keep` returns true.
    pub fn retain(&mut self, reason: &str, mut keep: impl FnMut(&ScoredPeer) -> bool) {
        self.entries.retain(|name, entry| {
            let kept = keep(entry);
            if !kept {
                tracing::debug!("Eliminated {}: {}", name, reason);
            }
            kept
        });
    }

    /// Highest score first, ties by peer name.
    pub fn ranked(&self) -> Vec<ScoredPeer> {
        let mut ranked: Vec<ScoredPeer> = self.entries.values().cloned().collect();
        ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name().cmp(b.name())));
        ranked
    }
}

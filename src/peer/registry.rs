use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::remote::RemotePeer;
use super::types::{HealthSettings, PeerDefinition, PeerEvent, PeerName, PeerSummary};
use crate::error::PeerError;
use crate::protocol::central::RpcSettings;

const EVENT_CAPACITY: usize = 256;

/// Every peer the master knows about, connected or not.
pub struct PeerRegistry {
    peers: DashMap<PeerName, Arc<RemotePeer>>,
    events: broadcast::Sender<PeerEvent>,
    health: HealthSettings,
    rpc: RpcSettings,
}

impl PeerRegistry {
    pub fn new(health: HealthSettings, rpc: RpcSettings) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            peers: DashMap::new(),
            events,
            health,
            rpc,
        })
    }

    pub fn health(&self) -> HealthSettings {
        self.health
    }

    pub fn rpc(&self) -> RpcSettings {
        self.rpc
    }

    pub fn add_peer(&self, definition: PeerDefinition) -> Result<Arc<RemotePeer>, PeerError> {
        let name = definition.name.clone();
        match self.peers.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(PeerError::AlreadyExists(name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let peer = RemotePeer::new(definition, self.health, self.rpc, self.events.clone());
                slot.insert(peer.clone());
                info!("Added peer {}", name);
                Ok(peer)
            }
        }
    }

    /// Disconnects and forgets the peer.
    pub fn remove_peer(&self, name: &PeerName) -> Result<Arc<RemotePeer>, PeerError> {
        let (_, peer) = self
            .peers
            .remove(name)
            .ok_or_else(|| PeerError::UnknownPeer(name.clone()))?;
        peer.disconnect("peer removed");
        info!("Removed peer {}", name);
        Ok(peer)
    }

    pub fn get(&self, name: &PeerName) -> Result<Arc<RemotePeer>, PeerError> {
        self.peers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PeerError::UnknownPeer(name.clone()))
    }

    /// All peers, ordered by name.
    pub fn peers(&self) -> Vec<Arc<RemotePeer>> {
        let mut peers: Vec<_> = self.peers.iter().map(|e| e.value().clone()).collect();
        peers.sort_by(|a, b| a.name().cmp(b.name()));
        peers
    }

    pub fn available_peers(&self) -> Vec<Arc<RemotePeer>> {
        self.peers()
            .into_iter()
            .filter(|peer| peer.is_available())
            .collect()
    }

    /// Unknown peers are simply not available.
    pub fn is_available(&self, name: &PeerName) -> bool {
        self.peers
            .get(name)
            .map(|entry| entry.value().is_available())
            .unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn definitions(&self) -> Vec<PeerDefinition> {
        self.peers().iter().map(|peer| peer.definition()).collect()
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        self.peers().iter().map(|peer| peer.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

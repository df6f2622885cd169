use anyhow::Result;
use rand::Rng;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MasterConfig;
use crate::error::{CoordinatorError, NamespaceError, NoPeerReason, PeerError, RpcError, SelectionError};
use crate::namespace::persist::{MasterSnapshot, load_snapshot, save_snapshot};
use crate::namespace::tree::Namespace;
use crate::namespace::types::{Child, normalize};
use crate::peer::connection::Transport;
use crate::peer::registry::PeerRegistry;
use crate::peer::remote::RemotePeer;
use crate::peer::types::{PeerDefinition, PeerEvent, PeerName, PeerState, PeerSummary};
use crate::protocol::central::ProtocolCentral;
use crate::remerge::RemergeSettings;
use crate::remerge::conflict::ConflictResolver;
use crate::remerge::merge::RemergeReport;
use crate::remerge::session::RemergeSession;
use crate::selection::chart::ScoredPeer;
use crate::selection::filter::{FilterEnv, FilterRegistry};
use crate::selection::manager::{SelectionConfig, SelectionManager};
use crate::selection::types::{ChainKind, FilterSpec, SelectionContext};

const MAX_RECONNECT_JITTER_MS: u64 = 1_000;

pub type RemergeHandle = JoinHandle<Result<RemergeReport, RpcError>>;

/// The master: peer registry, namespace and selection engine behind the
/// calls the client-facing layer and administrators make.
pub struct Coordinator {
    registry: Arc<PeerRegistry>,
    central: Arc<ProtocolCentral>,
    namespace: Arc<Namespace>,
    selection: SelectionManager,
    remerge: RemergeSettings,
    resolver: Arc<dyn ConflictResolver>,
    state_path: Option<PathBuf>,
    snapshot_interval: Duration,
    reconnect_interval: Duration,
}

impl Coordinator {
    /// A coordinator with an empty namespace and the configured seed peers.
    pub fn new(config: &MasterConfig) -> Result<Arc<Self>, CoordinatorError> {
        let coordinator = Self::with_namespace(config, Namespace::new())?;
        for definition in &config.peers {
            coordinator.add_peer(definition.clone())?;
        }
        Ok(coordinator)
    }

    fn with_namespace(
        config: &MasterConfig,
        namespace: Namespace,
    ) -> Result<Arc<Self>, CoordinatorError> {
        let registry = PeerRegistry::new(config.health.settings(), config.rpc.settings());
        let central = ProtocolCentral::builtin();
        let selection = SelectionManager::new(
            FilterRegistry::builtin(),
            FilterEnv {
                central: central.clone(),
            },
            &config.selection,
        )?;

        Ok(Arc::new(Self {
            registry,
            central,
            namespace: Arc::new(namespace),
            selection,
            remerge: config.remerge,
            resolver: config.remerge.conflict.resolver(),
            state_path: config.state_path.clone(),
            snapshot_interval: config.snapshot_interval(),
            reconnect_interval: config.reconnect_interval(),
        }))
    }

    /// Restores the last snapshot when there is one, then registers the
    /// configured peers that the snapshot does not already know.
    pub async fn bootstrap(config: &MasterConfig) -> Result<Arc<Self>> {
        let snapshot = match &config.state_path {
            Some(path) => load_snapshot(path).await?,
            None => None,
        };

        let (namespace, mut definitions) = match snapshot {
            Some(snapshot) => (Namespace::restore(&snapshot.namespace), snapshot.peers),
            None => (Namespace::new(), Vec::new()),
        };
        for definition in &config.peers {
            if !definitions.iter().any(|d| d.name == definition.name) {
                definitions.push(definition.clone());
            }
        }

        let coordinator = Self::with_namespace(config, namespace)?;
        for definition in definitions {
            coordinator.add_peer(definition)?;
        }
        info!(
            "Coordinator ready: {} peers, {} directories",
            coordinator.registry.len(),
            coordinator.namespace.directory_count()
        );
        Ok(coordinator)
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn central(&self) -> &Arc<ProtocolCentral> {
        &self.central
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    pub fn selection(&self) -> &SelectionManager {
        &self.selection
    }

    pub fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.registry.subscribe()
    }

    pub fn peer_summaries(&self) -> Vec<PeerSummary> {
        self.registry.summaries()
    }

    // ============================================================
    // CLIENT-FACING CALLS
    // ============================================================

    pub fn is_peer_available(&self, name: &PeerName) -> bool {
        self.registry.is_available(name)
    }

    pub fn list_owners(&self, path: &str) -> Result<BTreeSet<PeerName>, NamespaceError> {
        self.namespace.owners(path)
    }

    /// Ranks every available peer for receiving `ctx.path`.
    pub async fn select_peer_for_store(
        &self,
        ctx: &SelectionContext,
    ) -> Result<Vec<ScoredPeer>, SelectionError> {
        self.selection
            .select(ChainKind::Store, self.registry.peers(), ctx)
            .await
    }

    /// Ranks the available owners of `ctx.path` for serving it.
    pub async fn select_peer_for_retrieve(
        &self,
        ctx: &SelectionContext,
    ) -> Result<Vec<ScoredPeer>, SelectionError> {
        let owners = self.online_owners(&ctx.path)?;
        self.selection.select(ChainKind::Retrieve, owners, ctx).await
    }

    /// Ranks peers that could receive a new replica of `ctx.path`. Current
    /// owners are never candidates.
    pub async fn select_replication_target(
        &self,
        ctx: &SelectionContext,
    ) -> Result<Vec<ScoredPeer>, SelectionError> {
        let mut ctx = ctx.clone();
        if let Ok(owners) = self.namespace.owners(&ctx.path) {
            ctx.exclude.extend(owners);
        }
        self.selection
            .select(ChainKind::JobStore, self.registry.peers(), &ctx)
            .await
    }

    /// Ranks the owners of `ctx.path` as the source of a new replica.
    pub async fn select_replication_source(
        &self,
        ctx: &SelectionContext,
    ) -> Result<Vec<ScoredPeer>, SelectionError> {
        let owners = self.online_owners(&ctx.path)?;
        self.selection.select(ChainKind::JobRetrieve, owners, ctx).await
    }

    fn online_owners(&self, path: &str) -> Result<Vec<Arc<RemotePeer>>, SelectionError> {
        let not_found = SelectionError::NoAvailablePeer {
            reason: NoPeerReason::FileNotFound,
        };
        let meta = match normalize(path).ok().and_then(|p| self.namespace.lookup(&p)) {
            Some(Child::File(meta)) => meta,
            _ => return Err(not_found),
        };

        let owners: Vec<_> = meta
            .owners
            .iter()
            .filter_map(|name| self.registry.get(name).ok())
            .filter(|peer| peer.is_available())
            .collect();
        if owners.is_empty() {
            warn!("No owner of {} is online ({} known)", path, meta.owners.len());
            return Err(SelectionError::NoAvailablePeer {
                reason: NoPeerReason::NoOwnersOnline,
            });
        }
        Ok(owners)
    }

    // ============================================================
    // ADMINISTRATIVE SURFACE
    // ============================================================

    pub fn add_peer(&self, definition: PeerDefinition) -> Result<Arc<RemotePeer>, PeerError> {
        self.registry.add_peer(definition)
    }

    /// Forgets the peer and strips it from every ownership record. Returns
    /// the number of files that went with it.
    pub fn remove_peer(&self, name: &PeerName) -> Result<usize, PeerError> {
        self.registry.remove_peer(name)?;
        Ok(self.namespace.remove_peer_everywhere(name))
    }

    pub fn set_filter_chain_config(
        &self,
        kind: ChainKind,
        specs: &[FilterSpec],
    ) -> Result<(), CoordinatorError> {
        self.selection.set_chain(kind, specs)?;
        Ok(())
    }

    pub fn filter_chain_config(&self) -> SelectionConfig {
        self.selection.config()
    }

    /// Re-reads `subtree` (default `/`) from a connected peer.
    pub async fn force_remerge(
        &self,
        name: &PeerName,
        subtree: Option<&str>,
    ) -> Result<RemergeReport, CoordinatorError> {
        let peer = self.registry.get(name)?;
        let root = normalize(subtree.unwrap_or("/"))?;
        if !peer.state().is_connected() {
            return Err(PeerError::unavailable(name, "not connected").into());
        }
        Ok(self.remerge_session(peer).run(&root).await?)
    }

    /// Dials the peer and starts its initial remerge.
    pub async fn connect_peer(self: &Arc<Self>, name: &PeerName) -> Result<RemergeHandle, PeerError> {
        let peer = self.registry.get(name)?;
        peer.connect(&self.central).await?;
        Ok(self.spawn_initial_remerge(peer))
    }

    /// Like `connect_peer`, over a stream the caller already opened.
    pub async fn attach_peer<S: Transport>(
        self: &Arc<Self>,
        name: &PeerName,
        stream: S,
    ) -> Result<RemergeHandle, PeerError> {
        let peer = self.registry.get(name)?;
        peer.connect_stream(stream, &self.central).await?;
        Ok(self.spawn_initial_remerge(peer))
    }

    fn remerge_session(&self, peer: Arc<RemotePeer>) -> RemergeSession {
        RemergeSession::new(
            peer,
            self.namespace.clone(),
            self.central.clone(),
            self.resolver.clone(),
            self.remerge,
        )
    }

    fn spawn_initial_remerge(&self, peer: Arc<RemotePeer>) -> RemergeHandle {
        let session = self.remerge_session(peer);
        tokio::spawn(async move { session.run("/").await })
    }

    // ============================================================
    // BACKGROUND TASKS
    // ============================================================

    pub async fn start(self: Arc<Self>) {
        info!("Starting coordinator background tasks...");

        let _reconnect_handle = {
            let coordinator = self.clone();
            tokio::spawn(async move {
                coordinator.reconnect_loop().await;
            })
        };

        if self.state_path.is_some() {
            let coordinator = self.clone();
            tokio::spawn(async move {
                coordinator.snapshot_loop().await;
            });
        }

        info!("All background tasks started");
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.reconnect_interval);
        loop {
            interval.tick().await;
            self.reconnect_once().await;
        }
    }

    /// Dials every peer that is disconnected or offline, one after another.
    pub async fn reconnect_once(self: &Arc<Self>) -> usize {
        let mut connected = 0;
        for peer in self.registry.peers() {
            if !matches!(peer.state(), PeerState::Disconnected | PeerState::Offline) {
                continue;
            }
            let max_jitter = (self.reconnect_interval.as_millis() as u64 / 10).min(MAX_RECONNECT_JITTER_MS);
            let jitter = rand::thread_rng().gen_range(0..=max_jitter);
            tokio::time::sleep(Duration::from_millis(jitter)).await;

            match self.connect_peer(peer.name()).await {
                Ok(_) => {
                    connected += 1;
                }
                Err(PeerError::AlreadyOnline(_)) => {}
                Err(e) => debug!("Reconnect to {} failed: {}", peer.name(), e),
            }
        }
        connected
    }

    async fn snapshot_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.snapshot_interval);
        // The first tick fires immediately; nothing has changed yet.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = self.save_state().await {
                warn!("Failed to save coordinator state: {:#}", e);
            }
        }
    }

    pub fn snapshot(&self) -> MasterSnapshot {
        MasterSnapshot::new(self.registry.definitions(), self.namespace.snapshot())
    }

    /// Writes the snapshot if persistence is configured.
    pub async fn save_state(&self) -> Result<()> {
        match &self.state_path {
            Some(path) => save_snapshot(path, &self.snapshot()).await,
            None => Ok(()),
        }
    }
}

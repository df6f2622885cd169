//! Master-side record of one storage peer.
//!
//! `RemotePeer` owns the peer's definition, its health state, its current
//! connection (if any) and the bookkeeping the selection filters read. All
//! fields are individually locked or atomic, so two peers never contend and
//! readers of one peer never wait on a slow network operation.

use super::connection::{ConnectionObserver, PeerConnection, Transport};
use super::health::ErrorWindow;
use super::types::{
    DiskStatus, Direction, HealthSettings, PeerDefinition, PeerEvent, PeerName, PeerState,
    PeerSummary,
};
use crate::error::{PeerError, RpcError};
use crate::protocol::central::{ProtocolCentral, RpcSettings};
use crate::protocol::envelope::{CorrelationIndex, ListingFrame, ResponseBody};

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

/// Where a peer's listing frames go while a remerge is running.
pub trait ListingSink: Send + Sync {
    fn push(&self, frame: ListingFrame);
    /// The connection went away; drop whatever has not been applied yet.
    fn close(&self);
}

pub struct RemotePeer {
    name: PeerName,
    definition: RwLock<PeerDefinition>,
    settings: RwLock<HealthSettings>,
    rpc: RpcSettings,
    state: RwLock<PeerState>,
    errors: Mutex<ErrorWindow>,
    disk: RwLock<Option<DiskStatus>>,
    connection: RwLock<Option<Arc<PeerConnection>>>,
    listing_sink: RwLock<Option<Arc<dyn ListingSink>>>,
    remerging: AtomicBool,
    ping_outstanding: AtomicBool,
    active_transfers: AtomicUsize,
    last_store: AtomicU64,
    last_retrieve: AtomicU64,
    events: broadcast::Sender<PeerEvent>,
}

impl RemotePeer {
    pub fn new(
        definition: PeerDefinition,
        defaults: HealthSettings,
        rpc: RpcSettings,
        events: broadcast::Sender<PeerEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: definition.name.clone(),
            settings: RwLock::new(defaults.for_peer(&definition)),
            definition: RwLock::new(definition),
            rpc,
            state: RwLock::new(PeerState::Disconnected),
            errors: Mutex::new(ErrorWindow::new()),
            disk: RwLock::new(None),
            connection: RwLock::new(None),
            listing_sink: RwLock::new(None),
            remerging: AtomicBool::new(false),
            ping_outstanding: AtomicBool::new(false),
            active_transfers: AtomicUsize::new(0),
            last_store: AtomicU64::new(0),
            last_retrieve: AtomicU64::new(0),
            events,
        })
    }

    pub fn name(&self) -> &PeerName {
        &self.name
    }

    pub fn definition(&self) -> PeerDefinition {
        self.definition.read().clone()
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.definition.read().properties.get(key).cloned()
    }

    pub fn set_property(&self, key: &str, value: &str) {
        let mut def = self.definition.write();
        def.properties.insert(key.to_string(), value.to_string());
    }

    pub fn settings(&self) -> HealthSettings {
        *self.settings.read()
    }

    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    /// True only when the peer is fully usable for new work.
    pub fn is_available(&self) -> bool {
        self.state() == PeerState::Available
    }

    pub fn is_remerging(&self) -> bool {
        self.remerging.load(Ordering::SeqCst)
    }

    pub fn set_remerging(&self, remerging: bool) {
        self.remerging.store(remerging, Ordering::SeqCst);
    }

    fn transition(&self, to: PeerState, reason: &str) {
        let from = {
            let mut state = self.state.write();
            let from = *state;
            if from == to {
                return;
            }
            *state = to;
            from
        };
        self.announce(from, to, reason);
    }

    /// Claims the peer for one handshake. Checked and set under a single
    /// lock, so two dialers cannot both proceed.
    fn begin_handshake(&self) -> Result<(), PeerError> {
        let from = {
            let mut state = self.state.write();
            if state.is_connected() || *state == PeerState::Handshaking {
                return Err(PeerError::AlreadyOnline(self.name.clone()));
            }
            let from = *state;
            *state = PeerState::Handshaking;
            from
        };
        self.announce(from, PeerState::Handshaking, "connection established");
        Ok(())
    }

    fn announce(&self, from: PeerState, to: PeerState, reason: &str) {
        match to {
            PeerState::Offline => {
                tracing::warn!("Peer {} {:?} -> {:?}: {}", self.name, from, to, reason)
            }
            _ => tracing::info!("Peer {} {:?} -> {:?}: {}", self.name, from, to, reason),
        }

        // No subscribers is fine.
        let _ = self.events.send(PeerEvent {
            peer: self.name.clone(),
            from,
            to,
            reason: reason.to_string(),
        });
    }

    pub fn connection(&self) -> Result<Arc<PeerConnection>, PeerError> {
        match self.connection.read().as_ref() {
            Some(conn) if !conn.is_closed() => Ok(conn.clone()),
            _ => Err(PeerError::unavailable(&self.name, "not connected")),
        }
    }

    /// Dials the peer's endpoint and runs the handshake.
    pub async fn connect(
        self: &Arc<Self>,
        central: &Arc<ProtocolCentral>,
    ) -> Result<(), PeerError> {
        let endpoint = self.definition.read().endpoint.clone();
        let timeout = self.rpc.handshake_timeout;

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(PeerError::ConnectError {
                    peer: self.name.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(PeerError::ConnectError {
                    peer: self.name.clone(),
                    reason: format!("connect to {} timed out", endpoint),
                });
            }
        };
        let _ = stream.set_nodelay(true);

        self.connect_stream(stream, central).await
    }

    /// Runs the handshake on an already established stream and starts the
    /// connection workers. On success the peer is `Available`.
    pub async fn connect_stream<S: Transport>(
        self: &Arc<Self>,
        mut stream: S,
        central: &Arc<ProtocolCentral>,
    ) -> Result<(), PeerError> {
        self.begin_handshake()?;
        let definition = self.definition();
        let conn = Arc::new(PeerConnection::new(
            self.name.clone(),
            central.extensions().to_vec(),
            self.rpc.index_pool_size,
        ));

        if let Err(e) = central
            .handshake(&mut stream, &definition, self.rpc.handshake_timeout)
            .await
        {
            self.transition(PeerState::Offline, &e.to_string());
            return Err(e);
        }

        let observer: Arc<dyn ConnectionObserver> = self.clone();
        conn.start(stream, Arc::downgrade(&observer));

        self.errors.lock().clear();
        self.ping_outstanding.store(false, Ordering::SeqCst);
        *self.connection.write() = Some(conn.clone());
        self.transition(PeerState::Available, "handshake completed");

        self.spawn_keepalive(conn, central.clone());
        Ok(())
    }

    /// Watches the connection for silence: a keepalive ping after half the
    /// response timeout, offline after the full timeout.
    fn spawn_keepalive(self: &Arc<Self>, conn: Arc<PeerConnection>, central: Arc<ProtocolCentral>) {
        let weak = Arc::downgrade(self);
        let settings = self.settings();
        let tick = (settings.keepalive() / 4).max(Duration::from_millis(25));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                if conn.is_closed() {
                    break;
                }
                let Some(peer) = weak.upgrade() else {
                    break;
                };

                let silence = conn.silence();
                if silence > settings.response_timeout {
                    peer.mark_unavailable(&format!(
                        "no response from peer in {} milliseconds",
                        silence.as_millis()
                    ));
                    break;
                }

                if silence > settings.keepalive()
                    && !peer.ping_outstanding.swap(true, Ordering::SeqCst)
                {
                    if peer.state() == PeerState::Available {
                        peer.transition(PeerState::Degraded, "keepalive ping outstanding");
                    }
                    let central = central.clone();
                    tokio::spawn(async move {
                        let result = central
                            .basic()
                            .ping(&peer, settings.response_timeout)
                            .await;
                        peer.ping_outstanding.store(false, Ordering::SeqCst);
                        match result {
                            Ok(()) => {
                                if peer.state() == PeerState::Degraded {
                                    peer.transition(PeerState::Available, "keepalive answered");
                                }
                            }
                            Err(e) => tracing::warn!("Keepalive to {} failed: {}", peer.name, e),
                        }
                    });
                }
            }
        });
    }

    /// Administrative override. Only a connected peer can be made available.
    pub fn mark_available(&self) -> Result<(), PeerError> {
        self.connection()?;
        self.transition(PeerState::Available, "marked available");
        Ok(())
    }

    /// Drops the connection, fails every in-flight command and takes the
    /// peer out of selection.
    pub fn mark_unavailable(&self, reason: &str) {
        self.teardown();
        self.transition(PeerState::Offline, reason);
    }

    /// Administrative disconnect without implying a fault.
    pub fn disconnect(&self, reason: &str) {
        self.teardown();
        self.transition(PeerState::Disconnected, reason);
    }

    fn teardown(&self) {
        // Take both out first so no lock is held while they shut down.
        let conn = self.connection.write().take();
        let sink = self.listing_sink.write().take();
        if let Some(conn) = conn {
            conn.shutdown();
        }
        if let Some(sink) = sink {
            sink.close();
        }
        self.set_remerging(false);
        self.ping_outstanding.store(false, Ordering::SeqCst);
        *self.disk.write() = None;
    }

    /// Counts a network error. Returns true when this error pushed the peer
    /// over its threshold and took it offline.
    pub fn record_error(&self, reason: &str) -> bool {
        let settings = self.settings();
        let tripped = self.errors.lock().record(
            Instant::now(),
            settings.error_window,
            settings.max_errors,
            reason,
        );
        if tripped {
            tracing::error!("Too many network errors on {}: {}", self.name, reason);
            self.mark_unavailable(&format!("too many network errors - {}", reason));
        } else {
            tracing::debug!("Network error on {}: {}", self.name, reason);
        }
        tripped
    }

    pub fn recent_errors(&self) -> usize {
        let window = self.settings().error_window;
        self.errors.lock().count(Instant::now(), window)
    }

    pub async fn issue(
        &self,
        extension: &str,
        command: &str,
        args: Vec<String>,
    ) -> Result<CorrelationIndex, RpcError> {
        let conn = self.connection()?;
        let wait = self.settings().response_timeout;
        match conn.issue(extension, command, args, wait).await {
            Err(RpcError::Peer(e @ PeerError::PeerUnavailable { .. })) => {
                if !conn.is_closed() {
                    // Pool exhaustion with a silent peer.
                    self.mark_unavailable(&e.to_string());
                }
                Err(e.into())
            }
            other => other,
        }
    }

    pub async fn fetch_response(&self, index: CorrelationIndex) -> Result<ResponseBody, RpcError> {
        let timeout = self.settings().response_timeout;
        self.fetch_response_within(index, timeout).await
    }

    /// Waits for `index`. A timeout counts as a network error and fails only
    /// this call; a non-recoverable remote exception takes the peer offline.
    pub async fn fetch_response_within(
        &self,
        index: CorrelationIndex,
        timeout: Duration,
    ) -> Result<ResponseBody, RpcError> {
        let conn = self.connection()?;
        let result = conn.fetch_response(index, timeout).await;
        match &result {
            Err(RpcError::Remote(remote)) if !remote.is_recoverable() => {
                tracing::error!("Exception on {} the master cannot handle: {}", self.name, remote);
                self.mark_unavailable("exception on peer that is unable to be handled");
                return Err(PeerError::unavailable(&self.name, remote.message.clone()).into());
            }
            Err(RpcError::Peer(PeerError::PeerUnavailable { reason, .. })) if !conn.is_closed() => {
                self.record_error(reason);
            }
            _ => {}
        }
        result
    }

    pub fn disk_status(&self) -> Option<DiskStatus> {
        *self.disk.read()
    }

    pub fn set_disk_status(&self, status: DiskStatus) {
        *self.disk.write() = Some(status);
    }

    pub fn active_transfers(&self) -> usize {
        self.active_transfers.load(Ordering::SeqCst)
    }

    /// Registers a transfer for the lifetime of the returned guard.
    pub fn begin_transfer(self: &Arc<Self>, direction: Direction) -> TransferGuard {
        self.active_transfers.fetch_add(1, Ordering::SeqCst);
        self.touch_transfer(direction);
        TransferGuard { peer: self.clone() }
    }

    fn touch_transfer(&self, direction: Direction) {
        let now = now_ms();
        match direction {
            Direction::Store => self.last_store.store(now, Ordering::SeqCst),
            Direction::Retrieve => self.last_retrieve.store(now, Ordering::SeqCst),
        }
    }

    /// Milliseconds since the epoch of the last transfer in `direction`, 0 if never.
    pub fn last_transfer(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Store => self.last_store.load(Ordering::SeqCst),
            Direction::Retrieve => self.last_retrieve.load(Ordering::SeqCst),
        }
    }

    pub fn set_listing_sink(&self, sink: Arc<dyn ListingSink>) {
        let previous = self.listing_sink.write().replace(sink);
        if let Some(previous) = previous {
            previous.close();
        }
    }

    /// Detaches `sink` if it is still the current one.
    pub fn clear_listing_sink(&self, sink: &Arc<dyn ListingSink>) {
        let mut current = self.listing_sink.write();
        let same = current
            .as_ref()
            .map(|c| std::ptr::addr_eq(Arc::as_ptr(c), Arc::as_ptr(sink)))
            .unwrap_or(false);
        if same {
            current.take();
        }
    }

    pub fn summary(&self) -> PeerSummary {
        let definition = self.definition();
        PeerSummary {
            name: self.name.clone(),
            endpoint: definition.endpoint,
            state: self.state(),
            remerging: self.is_remerging(),
            disk: self.disk_status(),
            active_transfers: self.active_transfers(),
            recent_errors: self.recent_errors(),
            extensions: self
                .connection()
                .map(|c| c.extensions().to_vec())
                .unwrap_or_default(),
        }
    }
}

impl ConnectionObserver for RemotePeer {
    fn on_disk_status(&self, status: DiskStatus) {
        tracing::trace!("Disk status from {}: {:?}", self.name, status);
        self.set_disk_status(status);
    }

    fn on_listing(&self, frame: ListingFrame) {
        match self.listing_sink.read().as_ref() {
            Some(sink) => sink.push(frame),
            None => tracing::debug!("Dropping listing frame from {}, no remerge running", self.name),
        }
    }

    fn on_closed(&self, reason: String) {
        self.mark_unavailable(&reason);
    }
}

impl std::fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePeer")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Decrements the peer's active transfer count when dropped.
pub struct TransferGuard {
    peer: Arc<RemotePeer>,
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.peer.active_transfers.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

//! One running remerge of one peer.
//!
//! The connection's reader pushes listing frames into a `ListingQueue`; the
//! session drains it, assembles one directory at a time and merges it. When
//! the unprocessed backlog grows past the pause threshold the peer is asked to
//! pause its stream, and to resume once the session has caught up.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::conflict::ConflictResolver;
use super::merge::{RemergeReport, merge_directory_while};
use super::RemergeSettings;
use crate::error::RpcError;
use crate::namespace::tree::Namespace;
use crate::peer::remote::{ListingSink, RemotePeer};
use crate::protocol::central::ProtocolCentral;
use crate::protocol::envelope::{ChildRecord, ListingFrame};

pub struct ListingQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<ListingFrame>>>,
    backlog: AtomicUsize,
    paused: AtomicBool,
    closed: AtomicBool,
    settings: RemergeSettings,
    peer: Weak<RemotePeer>,
    central: Arc<ProtocolCentral>,
}

impl ListingQueue {
    pub fn new(
        peer: &Arc<RemotePeer>,
        central: Arc<ProtocolCentral>,
        settings: RemergeSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ListingFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            backlog: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            settings,
            peer: Arc::downgrade(peer),
            central,
        });
        (queue, rx)
    }

    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Called by the consumer after taking one frame off the queue.
    pub fn consumed(&self) {
        let remaining = self
            .backlog
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .map(|n| n.saturating_sub(1))
            .unwrap_or(0);
        if remaining <= self.settings.resume_threshold
            && self.paused.swap(false, Ordering::SeqCst)
        {
            self.signal(false);
        }
    }

    fn signal(&self, pause: bool) {
        let Some(peer) = self.peer.upgrade() else {
            return;
        };
        let central = self.central.clone();
        tokio::spawn(async move {
            let result = if pause {
                central.basic().remerge_pause(&peer).await
            } else {
                central.basic().remerge_resume(&peer).await
            };
            match result {
                Ok(()) => debug!(
                    "Remerge stream of {} {}",
                    peer.name(),
                    if pause { "paused" } else { "resumed" }
                ),
                Err(e) => warn!("Could not pause/resume remerge on {}: {}", peer.name(), e),
            }
        });
    }
}

impl ListingSink for ListingQueue {
    fn push(&self, frame: ListingFrame) {
        if self.is_closed() {
            return;
        }
        let backlog = self.backlog.fetch_add(1, Ordering::SeqCst) + 1;
        let sent = self
            .sender
            .lock()
            .as_ref()
            .map(|tx| tx.send(frame).is_ok())
            .unwrap_or(false);
        if !sent {
            self.backlog.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        if backlog > self.settings.pause_threshold && !self.paused.swap(true, Ordering::SeqCst) {
            debug!("Remerge backlog at {}, pausing", backlog);
            self.signal(true);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.sender.lock().take();
        self.backlog.store(0, Ordering::SeqCst);
    }
}

/// Reconciles the namespace with one peer's listing of `root`.
pub struct RemergeSession {
    id: Uuid,
    peer: Arc<RemotePeer>,
    namespace: Arc<Namespace>,
    central: Arc<ProtocolCentral>,
    resolver: Arc<dyn ConflictResolver>,
    settings: RemergeSettings,
}

impl RemergeSession {
    pub fn new(
        peer: Arc<RemotePeer>,
        namespace: Arc<Namespace>,
        central: Arc<ProtocolCentral>,
        resolver: Arc<dyn ConflictResolver>,
        settings: RemergeSettings,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            namespace,
            central,
            resolver,
            settings,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Runs until the peer reports the listing complete or the connection
    /// goes away. Directories already merged stay merged either way.
    pub async fn run(self, root: &str) -> Result<RemergeReport, RpcError> {
        let (queue, mut frames) =
            ListingQueue::new(&self.peer, self.central.clone(), self.settings);
        let sink: Arc<dyn ListingSink> = queue.clone();
        self.peer.set_listing_sink(sink.clone());
        self.peer.set_remerging(true);

        info!(
            session = %self.id,
            "Starting remerge of {} from {} ({} conflict resolution)",
            root,
            self.peer.name(),
            self.resolver.name()
        );

        if let Err(e) = self.central.basic().remerge(&self.peer, root).await {
            warn!("Remerge request to {} failed: {}", self.peer.name(), e);
            self.peer.clear_listing_sink(&sink);
            self.peer.set_remerging(false);
            return Err(e);
        }

        let mut report = RemergeReport {
            session: self.id,
            ..RemergeReport::default()
        };
        let mut current: Option<(String, Vec<ChildRecord>)> = None;

        while let Some(frame) = frames.recv().await {
            if queue.is_closed() {
                break;
            }
            queue.consumed();
            match frame {
                ListingFrame::Directory { path } => {
                    if let Some((unfinished, _)) = current.replace((path, Vec::new())) {
                        warn!("Listing of {} ended without a terminator", unfinished);
                    }
                }
                ListingFrame::Child(record) => match current.as_mut() {
                    Some((_, children)) => children.push(record),
                    None => warn!("Child {} outside of any directory", record.name),
                },
                ListingFrame::EndOfDirectory => {
                    if let Some((path, children)) = current.take() {
                        self.merge(&queue, &path, &children, &mut report);
                    }
                }
                ListingFrame::Complete { .. } => {
                    report.completed = true;
                    break;
                }
            }
        }

        self.peer.clear_listing_sink(&sink);
        if report.completed {
            self.peer.set_remerging(false);
            info!(
                session = %self.id,
                peer = %self.peer.name(),
                directories = report.directories,
                created = report.files_created,
                removed = report.files_removed,
                conflicts = report.conflicts.len(),
                "Remerge of {} finished",
                root
            );
        } else {
            warn!(
                session = %self.id,
                peer = %self.peer.name(),
                directories = report.directories,
                "Remerge of {} interrupted",
                root
            );
        }
        Ok(report)
    }

    fn merge(
        &self,
        queue: &ListingQueue,
        path: &str,
        children: &[ChildRecord],
        report: &mut RemergeReport,
    ) {
        // Closing the queue happens before the peer's ownership is stripped,
        // so checking it under the directory lock keeps a removed peer out.
        if let Err(e) = merge_directory_while(
            &self.namespace,
            self.peer.name(),
            path,
            children,
            self.resolver.as_ref(),
            report,
            || !queue.is_closed(),
        ) {
            warn!("Could not merge {} from {}: {}", path, self.peer.name(), e);
            report.errors += 1;
        }
    }
}

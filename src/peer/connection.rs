//! One long-lived connection to a storage peer.
//!
//! After the handshake the stream is split into two workers:
//! - a **writer** draining an unbounded queue of `CommandEnvelope`s, so issuing
//!   a command never waits on network I/O;
//! - a **reader** routing every incoming `PeerMessage`: correlated responses go
//!   to the waiting caller's oneshot, disk status and listing frames go to the
//!   connection's observer.
//!
//! Closing the connection drops every pending oneshot, which every waiting
//! caller observes as `PeerUnavailable`.

use crate::error::{PeerError, RpcError};
use crate::peer::types::{DiskStatus, PeerName};
use crate::protocol::codec::{read_frame, write_frame};
use crate::protocol::envelope::{
    CommandEnvelope, CorrelationIndex, ListingFrame, PeerMessage, RemoteError, ResponseBody,
};
use crate::protocol::index::IndexPool;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Outcome = Result<ResponseBody, RemoteError>;

/// Any byte stream a peer connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Receives what the reader cannot route to a caller.
pub trait ConnectionObserver: Send + Sync {
    fn on_disk_status(&self, status: DiskStatus);
    fn on_listing(&self, frame: ListingFrame);
    fn on_closed(&self, reason: String);
}

pub struct PeerConnection {
    peer: PeerName,
    extensions: Vec<String>,
    handshaken: AtomicBool,
    closed: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<CommandEnvelope>>>,
    pending: DashMap<CorrelationIndex, oneshot::Sender<Outcome>>,
    waiting: DashMap<CorrelationIndex, oneshot::Receiver<Outcome>>,
    pool: IndexPool,
    last_response: Mutex<Instant>,
    last_command: Mutex<Instant>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerConnection {
    /// A connection whose handshake has not completed yet. Every `issue`
    /// against it fails fast.
    pub fn new(peer: PeerName, extensions: Vec<String>, pool_size: u32) -> Self {
        let now = Instant::now();
        Self {
            peer,
            extensions,
            handshaken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            outbound: Mutex::new(None),
            pending: DashMap::new(),
            waiting: DashMap::new(),
            pool: IndexPool::new(pool_size),
            last_response: Mutex::new(now),
            last_command: Mutex::new(now),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn peer(&self) -> &PeerName {
        &self.peer
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn is_handshaken(&self) -> bool {
        self.handshaken.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Starts the reader and writer on a stream that has completed its
    /// handshake.
    pub fn start<S: Transport>(
        self: &Arc<Self>,
        stream: S,
        observer: Weak<dyn ConnectionObserver>,
    ) {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<CommandEnvelope>();
        *self.outbound.lock() = Some(tx);
        *self.last_response.lock() = Instant::now();

        let writer_task = {
            let conn = Arc::downgrade(self);
            let observer = observer.clone();
            tokio::spawn(async move {
                while let Some(command) = rx.recv().await {
                    if let Err(e) = write_frame(&mut writer, &command).await {
                        tracing::error!("Error sending {} to peer: {}", command.command, e);
                        if let Some(conn) = conn.upgrade() {
                            if conn.is_closed() {
                                break;
                            }
                            conn.shutdown();
                        }
                        if let Some(observer) = observer.upgrade() {
                            observer.on_closed(format!("error sending command: {}", e));
                        }
                        break;
                    }
                }
            })
        };

        let reader_task = {
            let conn = Arc::downgrade(self);
            tokio::spawn(async move {
                let reason = loop {
                    let message = match read_frame::<_, PeerMessage>(&mut reader).await {
                        Ok(Some(message)) => message,
                        Ok(None) => break "connection closed by peer".to_string(),
                        Err(e) => break format!("error reading from peer: {}", e),
                    };
                    let Some(live) = conn.upgrade() else {
                        return;
                    };
                    *live.last_response.lock() = Instant::now();

                    match message {
                        PeerMessage::Response(envelope) => {
                            match live.pending.remove(&envelope.index) {
                                Some((_, sender)) => {
                                    let _ = sender.send(envelope.outcome);
                                }
                                None => tracing::warn!(
                                    "Discarding response for index {} from {} with nobody waiting",
                                    envelope.index,
                                    live.peer
                                ),
                            }
                        }
                        PeerMessage::DiskStatus(status) => {
                            if let Some(observer) = observer.upgrade() {
                                observer.on_disk_status(status);
                            }
                        }
                        PeerMessage::Listing(frame) => {
                            if let Some(observer) = observer.upgrade() {
                                observer.on_listing(frame);
                            }
                        }
                    }
                };

                if let Some(conn) = conn.upgrade() {
                    if conn.is_closed() {
                        return;
                    }
                    conn.shutdown();
                }
                if let Some(observer) = observer.upgrade() {
                    observer.on_closed(reason);
                }
            })
        };

        self.workers.lock().extend([writer_task, reader_task]);
        self.handshaken.store(true, Ordering::SeqCst);
    }

    /// Allocates an index and queues the envelope for the writer.
    pub async fn issue(
        &self,
        extension: &str,
        command: &str,
        args: Vec<String>,
        index_wait: Duration,
    ) -> Result<CorrelationIndex, RpcError> {
        if !self.is_handshaken() {
            return Err(RpcError::HandshakeIncomplete {
                command: command.to_string(),
            });
        }
        if !self.extensions.iter().any(|e| e == extension) {
            return Err(RpcError::ExtensionNotNegotiated(extension.to_string()));
        }
        if self.is_closed() {
            return Err(PeerError::unavailable(&self.peer, "connection closed").into());
        }

        let index = match self.pool.acquire(index_wait).await {
            Some(index) => index,
            None => {
                return Err(PeerError::unavailable(
                    &self.peer,
                    format!(
                        "index pool exhausted and no response in {:?}",
                        self.silence()
                    ),
                )
                .into());
            }
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(index, tx);
        self.waiting.insert(index, rx);

        let envelope = CommandEnvelope {
            index,
            command: command.to_string(),
            args,
        };
        let sent = self
            .outbound
            .lock()
            .as_ref()
            .map(|out| out.send(envelope).is_ok())
            .unwrap_or(false);
        if !sent {
            self.forget(index);
            return Err(PeerError::unavailable(&self.peer, "connection closed").into());
        }

        *self.last_command.lock() = Instant::now();
        tracing::trace!("Issued {} to {} with index {}", command, self.peer, index);
        Ok(index)
    }

    /// Waits for the response tagged `index`. The index is released whatever
    /// the outcome.
    pub async fn fetch_response(
        &self,
        index: CorrelationIndex,
        timeout: Duration,
    ) -> Result<ResponseBody, RpcError> {
        let receiver = match self.waiting.remove(&index) {
            Some((_, receiver)) => receiver,
            None => return Err(RpcError::UnknownIndex(index)),
        };

        // Released on every exit, including the caller dropping this future.
        let _release = IndexRelease { conn: self, index };
        let result = tokio::time::timeout(timeout, receiver).await;

        match result {
            Ok(Ok(Ok(body))) => Ok(body),
            Ok(Ok(Err(remote))) => Err(RpcError::Remote(remote)),
            Ok(Err(_)) => Err(PeerError::unavailable(
                &self.peer,
                "went offline while processing command",
            )
            .into()),
            Err(_) => Err(PeerError::unavailable(
                &self.peer,
                format!("no response to index {} within {:?}", index, timeout),
            )
            .into()),
        }
    }

    fn forget(&self, index: CorrelationIndex) {
        self.pending.remove(&index);
        self.waiting.remove(&index);
        self.pool.release(index);
    }

    pub fn outstanding(&self) -> usize {
        self.pool.outstanding()
    }

    /// Time since the peer last sent anything.
    pub fn silence(&self) -> Duration {
        self.last_response.lock().elapsed()
    }

    pub fn since_last_command(&self) -> Duration {
        self.last_command.lock().elapsed()
    }

    /// Stops both workers and fails every in-flight command.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound.lock().take();
        self.pending.clear();
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        tracing::debug!("Connection to {} shut down", self.peer);
    }
}

struct IndexRelease<'a> {
    conn: &'a PeerConnection,
    index: CorrelationIndex,
}

impl Drop for IndexRelease<'_> {
    fn drop(&mut self) {
        self.conn.forget(self.index);
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().drain(..) {
            worker.abort();
        }
    }
}

//! In-memory storage peer used by the test suites.

use super::endpoint::PeerEndpoint;
use super::envelope::{
    ChildRecord, EntryKind, ListingFrame, RemoteError, RemoteErrorKind, ResponseBody,
    TransferStatus,
};
use super::handler::{Handler, HandlerContext, HandlerRegistry};
use super::issuer::{basic, transfer};
use crate::peer::types::{DiskStatus, PeerName};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::DuplexStream;

/// Directory path -> immediate children, as a peer would read from disk.
#[derive(Default)]
pub struct MemoryDisk {
    pub tree: Mutex<BTreeMap<String, Vec<ChildRecord>>>,
    pub disk: Mutex<DiskStatus>,
    pub checksum_delays: Mutex<HashMap<String, Duration>>,
    pub stall_pings: AtomicBool,
    pub pauses: AtomicUsize,
    pub resumes: AtomicUsize,
}

impl MemoryDisk {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a file and every missing parent directory.
    pub fn add_file(&self, path: &str, size: u64, checksum: u64) {
        let mut tree = self.tree.lock();
        let (dir, name) = split(path);
        ensure_dir(&mut tree, &dir);
        let children = tree.entry(dir).or_default();
        children.retain(|c| c.name != name);
        children.push(ChildRecord::file(name, size, checksum, 1_000));
        children.sort_by(|a, b| a.name.cmp(&b.name));
    }

    pub fn remove_file(&self, path: &str) {
        let (dir, name) = split(path);
        if let Some(children) = self.tree.lock().get_mut(&dir) {
            children.retain(|c| c.name != name);
        }
    }

    pub fn set_disk(&self, free_bytes: u64, total_bytes: u64) {
        *self.disk.lock() = DiskStatus {
            free_bytes,
            total_bytes,
        };
    }

    /// Frames a listing of `root` and everything below it.
    pub fn listing(&self, root: &str) -> Vec<ListingFrame> {
        let tree = self.tree.lock();
        let prefix = if root == "/" {
            "/".to_string()
        } else {
            format!("{}/", root)
        };
        let mut frames = Vec::new();
        for (dir, children) in tree.iter() {
            if dir != root && !dir.starts_with(&prefix) {
                continue;
            }
            frames.push(ListingFrame::Directory { path: dir.clone() });
            for child in children {
                frames.push(ListingFrame::Child(child.clone()));
            }
            frames.push(ListingFrame::EndOfDirectory);
        }
        frames.push(ListingFrame::Complete {
            root: root.to_string(),
        });
        frames
    }

    pub fn registry(self: &Arc<Self>) -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(BasicHandler { disk: self.clone() }));
        registry.register(Arc::new(TransferHandler));
        Arc::new(registry)
    }

    pub fn basic_only_registry(self: &Arc<Self>) -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(BasicHandler { disk: self.clone() }));
        Arc::new(registry)
    }
}

fn split(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(pos) => (path[..pos].to_string(), path[pos + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

fn ensure_dir(tree: &mut BTreeMap<String, Vec<ChildRecord>>, dir: &str) {
    if tree.contains_key(dir) {
        return;
    }
    tree.insert(dir.to_string(), Vec::new());
    if dir == "/" {
        return;
    }
    let (parent, name) = split(dir);
    ensure_dir(tree, &parent);
    if let Some(children) = tree.get_mut(&parent) {
        if !children.iter().any(|c| c.name == name && c.kind == EntryKind::Directory) {
            children.push(ChildRecord::directory(name, 1_000));
            children.sort_by(|a, b| a.name.cmp(&b.name));
        }
    }
}

struct BasicHandler {
    disk: Arc<MemoryDisk>,
}

#[async_trait]
impl Handler for BasicHandler {
    fn extension(&self) -> &'static str {
        basic::EXTENSION
    }

    fn commands(&self) -> &'static [&'static str] {
        basic::COMMANDS
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        command: &str,
        args: &[String],
    ) -> Result<ResponseBody, RemoteError> {
        match command {
            basic::PING => {
                if self.disk.stall_pings.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(ResponseBody::Pong)
            }
            basic::CHECKSUM => {
                let path = args.first().cloned().unwrap_or_default();
                let delay = self.disk.checksum_delays.lock().get(&path).copied();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if path == "/explode" {
                    return Err(RemoteError::new(RemoteErrorKind::Internal, "disk on fire"));
                }
                let (dir, name) = split(&path);
                let tree = self.disk.tree.lock();
                tree.get(&dir)
                    .and_then(|children| children.iter().find(|c| c.name == name))
                    .map(|c| ResponseBody::Checksum(c.checksum))
                    .ok_or_else(|| RemoteError::not_found(path.clone()))
            }
            basic::DELETE => {
                let path = args.first().cloned().unwrap_or_default();
                self.disk.remove_file(&path);
                Ok(ResponseBody::Empty)
            }
            basic::REMERGE => {
                let root = args.first().cloned().unwrap_or_else(|| "/".to_string());
                let frames = self.disk.listing(&root);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    for frame in frames {
                        ctx.send_listing(frame);
                    }
                });
                Ok(ResponseBody::Empty)
            }
            basic::REMERGE_PAUSE => {
                self.disk.pauses.fetch_add(1, Ordering::SeqCst);
                Ok(ResponseBody::Empty)
            }
            basic::REMERGE_RESUME => {
                self.disk.resumes.fetch_add(1, Ordering::SeqCst);
                Ok(ResponseBody::Empty)
            }
            basic::DISK_STATUS => Ok(ResponseBody::DiskStatus(*self.disk.disk.lock())),
            _ => Err(RemoteError::io(format!("{} not implemented", command))),
        }
    }
}

struct TransferHandler;

#[async_trait]
impl Handler for TransferHandler {
    fn extension(&self) -> &'static str {
        transfer::EXTENSION
    }

    fn commands(&self) -> &'static [&'static str] {
        transfer::COMMANDS
    }

    async fn handle(
        &self,
        _ctx: &HandlerContext,
        command: &str,
        args: &[String],
    ) -> Result<ResponseBody, RemoteError> {
        let id = args.first().cloned().unwrap_or_default();
        match command {
            transfer::TRANSFER_STATUS => Ok(ResponseBody::TransferStatus(TransferStatus {
                transfer_id: id,
                transferred: 0,
                finished: true,
            })),
            _ => Ok(ResponseBody::Empty),
        }
    }
}

/// Starts a simulated peer and returns the master's end of the stream.
pub fn spawn_peer(name: &str, registry: Arc<HandlerRegistry>, disk: DiskStatus) -> DuplexStream {
    let (master_side, peer_side) = tokio::io::duplex(64 * 1024);
    let endpoint = PeerEndpoint::new(PeerName::new(name), registry).with_disk_status(disk);
    tokio::spawn(async move {
        let _ = endpoint.serve(peer_side).await;
    });
    master_side
}

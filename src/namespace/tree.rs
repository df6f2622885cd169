use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::types::{
    Child, DirectoryNode, FileMeta, NamespaceSnapshot, SnapshotEntry, is_within, join, normalize,
    split_path,
};
use crate::error::NamespaceError;
use crate::peer::remote::now_ms;
use crate::peer::types::PeerName;

type NodeRef = Arc<RwLock<DirectoryNode>>;

/// The master's virtual directory tree.
///
/// Each directory is its own lock. Operations lock the directories they touch
/// and nothing else; when two directories are locked together the one whose
/// path sorts first is locked first, which also puts parents before children.
pub struct Namespace {
    dirs: DashMap<String, NodeRef>,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace {
    pub fn new() -> Self {
        let dirs = DashMap::new();
        dirs.insert("/".to_string(), Arc::new(RwLock::new(DirectoryNode::default())));
        Self { dirs }
    }

    pub(crate) fn node(&self, path: &str) -> Option<NodeRef> {
        // Clone out of the map before anyone locks the node.
        self.dirs.get(path).map(|entry| entry.value().clone())
    }

    fn dir_node(&self, path: &str) -> Result<NodeRef, NamespaceError> {
        match self.node(path) {
            Some(node) => Ok(node),
            None => match self.lookup(path) {
                Some(Child::File(_)) => Err(NamespaceError::NotADirectory(path.to_string())),
                _ => Err(NamespaceError::NotFound(path.to_string())),
            },
        }
    }

    /// Records a directory node for `path`. The caller holds the parent's
    /// write lock and has inserted the matching `Child::Directory`.
    pub(crate) fn register_dir(&self, path: &str) {
        self.dirs
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(DirectoryNode::default())));
    }

    /// Drops the nodes of `path` and every directory below it.
    pub(crate) fn forget_subtree(&self, path: &str) {
        self.dirs.retain(|dir, _| !is_within(dir, path) || dir == "/");
    }

    pub fn lookup(&self, path: &str) -> Option<Child> {
        let path = normalize(path).ok()?;
        if path == "/" {
            return Some(Child::Directory { modified: 0 });
        }
        let (parent, name) = split_path(&path)?;
        let node = self.node(parent)?;
        let guard = node.read();
        guard.children.get(name).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// Immediate children of a directory, ordered by name.
    pub fn list(&self, path: &str) -> Result<Vec<(String, Child)>, NamespaceError> {
        let path = normalize(path)?;
        let node = self.dir_node(&path)?;
        let guard = node.read();
        Ok(guard
            .children
            .iter()
            .map(|(name, child)| (name.clone(), child.clone()))
            .collect())
    }

    /// Creates `path` and any missing parent directories.
    pub fn create_directory_all(&self, path: &str) -> Result<(), NamespaceError> {
        let path = normalize(path)?;
        let mut current = "/".to_string();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let next = join(&current, component);
            let node = self.dir_node(&current)?;
            {
                let mut guard = node.write();
                match guard.children.get(component) {
                    Some(Child::File(_)) => return Err(NamespaceError::NotADirectory(next)),
                    Some(Child::Directory { .. }) => {}
                    None => {
                        guard.children.insert(
                            component.to_string(),
                            Child::Directory { modified: now_ms() },
                        );
                        self.register_dir(&next);
                    }
                }
            }
            current = next;
        }
        Ok(())
    }

    /// Adds a file owned by `owner`. The parent directory must exist.
    pub fn create_file(
        &self,
        path: &str,
        size: u64,
        checksum: u64,
        owner: PeerName,
    ) -> Result<(), NamespaceError> {
        let path = normalize(path)?;
        let (parent, name) =
            split_path(&path).ok_or_else(|| NamespaceError::InvalidPath(path.clone()))?;
        let node = self.dir_node(parent)?;
        let mut guard = node.write();
        if guard.children.contains_key(name) {
            return Err(NamespaceError::AlreadyExists(path));
        }
        guard.children.insert(
            name.to_string(),
            Child::File(FileMeta::owned_by(size, checksum, now_ms(), owner)),
        );
        tracing::debug!("Created {}", path);
        Ok(())
    }

    fn with_file<T>(
        &self,
        path: &str,
        f: impl FnOnce(&mut DirectoryNode, &str) -> Result<T, NamespaceError>,
    ) -> Result<T, NamespaceError> {
        let path = normalize(path)?;
        let (parent, name) =
            split_path(&path).ok_or_else(|| NamespaceError::NotAFile(path.clone()))?;
        let node = self
            .node(parent)
            .ok_or_else(|| NamespaceError::NotFound(path.clone()))?;
        let mut guard = node.write();
        match guard.children.get(name) {
            None => Err(NamespaceError::NotFound(path.clone())),
            Some(Child::Directory { .. }) => Err(NamespaceError::NotAFile(path.clone())),
            Some(Child::File(_)) => f(&mut guard, name),
        }
    }

    pub fn add_owner(&self, path: &str, peer: &PeerName) -> Result<(), NamespaceError> {
        self.with_file(path, |node, name| {
            if let Some(Child::File(meta)) = node.children.get_mut(name) {
                meta.owners.insert(peer.clone());
            }
            Ok(())
        })
    }

    /// Removes `peer` as an owner. Returns true when that left the file with
    /// no owner and the file was removed.
    pub fn remove_owner(&self, path: &str, peer: &PeerName) -> Result<bool, NamespaceError> {
        self.with_file(path, |node, name| {
            let emptied = match node.children.get_mut(name) {
                Some(Child::File(meta)) => {
                    meta.owners.remove(peer);
                    meta.owners.is_empty()
                }
                _ => false,
            };
            if emptied {
                node.children.remove(name);
            }
            Ok(emptied)
        })
    }

    pub fn owners(&self, path: &str) -> Result<BTreeSet<PeerName>, NamespaceError> {
        let normalized = normalize(path)?;
        match self.lookup(&normalized) {
            Some(Child::File(meta)) => Ok(meta.owners),
            Some(Child::Directory { .. }) => Err(NamespaceError::NotAFile(normalized)),
            None => Err(NamespaceError::NotFound(normalized)),
        }
    }

    /// Removes a file, or a directory with everything below it.
    pub fn delete(&self, path: &str) -> Result<Child, NamespaceError> {
        let path = normalize(path)?;
        let (parent, name) =
            split_path(&path).ok_or_else(|| NamespaceError::InvalidPath(path.clone()))?;
        let node = self
            .node(parent)
            .ok_or_else(|| NamespaceError::NotFound(path.clone()))?;
        let removed = {
            let mut guard = node.write();
            guard
                .children
                .remove(name)
                .ok_or_else(|| NamespaceError::NotFound(path.clone()))?
        };
        if let Child::Directory { .. } = removed {
            self.forget_subtree(&path);
        }
        tracing::debug!("Deleted {}", path);
        Ok(removed)
    }

    /// Moves an entry to `to`, whose parent must exist and which must not.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), NamespaceError> {
        let from = normalize(from)?;
        let to = normalize(to)?;
        if is_within(&to, &from) {
            return Err(NamespaceError::InvalidPath(to));
        }
        let (from_parent, from_name) =
            split_path(&from).ok_or_else(|| NamespaceError::InvalidPath(from.clone()))?;
        let (to_parent, to_name) =
            split_path(&to).ok_or_else(|| NamespaceError::InvalidPath(to.clone()))?;

        let source = self
            .node(from_parent)
            .ok_or_else(|| NamespaceError::NotFound(from.clone()))?;
        let target = self.dir_node(to_parent)?;

        // Directory nodes move while both parents are locked, so nobody sees
        // the entry under its new name before its node is there.
        if from_parent == to_parent {
            let mut guard = source.write();
            if guard.children.contains_key(to_name) {
                return Err(NamespaceError::AlreadyExists(to));
            }
            let child = guard
                .children
                .remove(from_name)
                .ok_or_else(|| NamespaceError::NotFound(from.clone()))?;
            if let Child::Directory { .. } = child {
                self.rekey_subtree(&from, &to);
            }
            guard.children.insert(to_name.to_string(), child);
        } else {
            let (mut source_guard, mut target_guard) = if from_parent < to_parent {
                let s = source.write();
                let t = target.write();
                (s, t)
            } else {
                let t = target.write();
                let s = source.write();
                (s, t)
            };
            if target_guard.children.contains_key(to_name) {
                return Err(NamespaceError::AlreadyExists(to));
            }
            let child = source_guard
                .children
                .remove(from_name)
                .ok_or_else(|| NamespaceError::NotFound(from.clone()))?;
            if let Child::Directory { .. } = child {
                self.rekey_subtree(&from, &to);
            }
            target_guard.children.insert(to_name.to_string(), child);
        }
        tracing::debug!("Renamed {} to {}", from, to);
        Ok(())
    }

    /// Moves the nodes of `from` and everything below it to `to`. The caller
    /// holds the write locks of both parents.
    fn rekey_subtree(&self, from: &str, to: &str) {
        let moved: Vec<String> = self
            .dirs
            .iter()
            .filter(|entry| is_within(entry.key(), from))
            .map(|entry| entry.key().clone())
            .collect();
        for old in moved {
            if let Some((_, node)) = self.dirs.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                self.dirs.insert(new, node);
            }
        }
    }

    /// Strips `peer` from every ownership record. Returns the number of files
    /// removed because `peer` was their last owner.
    pub fn remove_peer_everywhere(&self, peer: &PeerName) -> usize {
        let nodes: Vec<NodeRef> = self.dirs.iter().map(|e| e.value().clone()).collect();
        let mut removed = 0;
        for node in nodes {
            let mut guard = node.write();
            guard.children.retain(|_, child| match child {
                Child::File(meta) => {
                    meta.owners.remove(peer);
                    if meta.owners.is_empty() {
                        removed += 1;
                        false
                    } else {
                        true
                    }
                }
                Child::Directory { .. } => true,
            });
        }
        tracing::info!("Removed {} from all ownership records ({} files dropped)", peer, removed);
        removed
    }

    /// Every file below `path` (inclusive) owned by `peer`.
    pub fn files_owned_by(&self, peer: &PeerName, path: &str) -> Vec<String> {
        let mut files = Vec::new();
        let dirs: Vec<(String, NodeRef)> = self
            .dirs
            .iter()
            .filter(|e| is_within(e.key(), path))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (dir, node) in dirs {
            let guard = node.read();
            for (name, child) in &guard.children {
                if let Child::File(meta) = child {
                    if meta.owners.contains(peer) {
                        files.push(join(&dir, name));
                    }
                }
            }
        }
        files.sort();
        files
    }

    pub fn directory_count(&self) -> usize {
        self.dirs.len()
    }

    pub fn snapshot(&self) -> NamespaceSnapshot {
        let dirs: Vec<(String, NodeRef)> = self
            .dirs
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut entries = Vec::new();
        for (dir, node) in dirs {
            let guard = node.read();
            for (name, child) in &guard.children {
                entries.push(SnapshotEntry {
                    path: join(&dir, name),
                    entry: child.clone(),
                });
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        NamespaceSnapshot { entries }
    }

    /// Rebuilds a tree from a snapshot. Entries are applied parents first;
    /// anything that no longer fits (bad path, ownerless file) is skipped.
    pub fn restore(snapshot: &NamespaceSnapshot) -> Self {
        let namespace = Self::new();
        for item in &snapshot.entries {
            let Ok(path) = normalize(&item.path) else {
                tracing::warn!("Skipping snapshot entry with bad path {}", item.path);
                continue;
            };
            let Some((parent, name)) = split_path(&path) else {
                continue;
            };
            if namespace.create_directory_all(parent).is_err() {
                tracing::warn!("Skipping snapshot entry {}", path);
                continue;
            }
            let Some(node) = namespace.node(parent) else {
                continue;
            };
            let mut guard = node.write();
            match &item.entry {
                Child::File(meta) if meta.owners.is_empty() => {
                    tracing::warn!("Skipping ownerless file {} in snapshot", path);
                }
                Child::File(_) => {
                    guard.children.insert(name.to_string(), item.entry.clone());
                }
                Child::Directory { .. } => {
                    guard.children.insert(name.to_string(), item.entry.clone());
                    namespace.register_dir(&path);
                }
            }
        }
        namespace
    }
}

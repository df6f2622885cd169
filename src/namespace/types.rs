use crate::error::NamespaceError;
use crate::peer::types::PeerName;
use crate::protocol::envelope::EntryKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Metadata of a file inode. `owners` is never empty for a file that exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    /// Zero when unknown.
    pub checksum: u64,
    pub modified: u64,
    pub owners: BTreeSet<PeerName>,
}

impl FileMeta {
    pub fn owned_by(size: u64, checksum: u64, modified: u64, owner: PeerName) -> Self {
        Self {
            size,
            checksum,
            modified,
            owners: BTreeSet::from([owner]),
        }
    }

    /// Same content as far as the master can tell. An unknown checksum on
    /// either side only compares sizes.
    pub fn matches(&self, size: u64, checksum: u64) -> bool {
        if self.size != size {
            return false;
        }
        self.checksum == 0 || checksum == 0 || self.checksum == checksum
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Child {
    File(FileMeta),
    Directory { modified: u64 },
}

impl Child {
    pub fn kind(&self) -> EntryKind {
        match self {
            Child::File(_) => EntryKind::File,
            Child::Directory { .. } => EntryKind::Directory,
        }
    }

    pub fn as_file(&self) -> Option<&FileMeta> {
        match self {
            Child::File(meta) => Some(meta),
            Child::Directory { .. } => None,
        }
    }
}

/// Immediate children of one directory. Locked as a unit, so a reader never
/// sees a half-applied update of the directory.
#[derive(Debug, Default)]
pub struct DirectoryNode {
    pub children: BTreeMap<String, Child>,
}

/// Flat, path-ordered form of the tree used for persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NamespaceSnapshot {
    pub entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotEntry {
    pub path: String,
    pub entry: Child,
}

/// Canonical form of an absolute path: leading `/`, no trailing `/`, no
/// empty, `.` or `..` components. The root is `/`.
pub fn normalize(path: &str) -> Result<String, NamespaceError> {
    if !path.starts_with('/') {
        return Err(NamespaceError::InvalidPath(path.to_string()));
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok("/".to_string());
    }
    for component in trimmed[1..].split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(NamespaceError::InvalidPath(path.to_string()));
        }
    }
    Ok(trimmed.to_string())
}

/// Splits a normalized, non-root path into parent directory and name.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    match path.rfind('/') {
        Some(_) if path == "/" => None,
        Some(0) => Some(("/", &path[1..])),
        Some(pos) => Some((&path[..pos], &path[pos + 1..])),
        None => None,
    }
}

pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// True when `path` is `ancestor` or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

//! Folds one directory of a peer's listing into the namespace.
//!
//! The whole directory is applied under that directory's write lock. Work on
//! entries below it (pruning a subtree the peer no longer has) locks the
//! children after the parent, never the other way round.

use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::conflict::{ConflictResolver, ReconciliationConflict, Resolution};
use crate::error::NamespaceError;
use crate::namespace::tree::Namespace;
use crate::namespace::types::{Child, DirectoryNode, FileMeta, join, normalize};
use crate::peer::types::PeerName;
use crate::protocol::envelope::{ChildRecord, EntryKind};

/// What a remerge changed.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RemergeReport {
    /// Session that produced the report; nil for direct merges.
    pub session: Uuid,
    pub directories: usize,
    pub files_created: usize,
    pub directories_created: usize,
    pub owners_added: usize,
    pub owners_removed: usize,
    pub files_removed: usize,
    pub directories_removed: usize,
    pub conflicts: Vec<ReconciliationConflict>,
    pub errors: usize,
    pub completed: bool,
}

impl RemergeReport {
    /// True when applying the listing left the namespace untouched.
    pub fn is_noop(&self) -> bool {
        self.files_created == 0
            && self.directories_created == 0
            && self.owners_added == 0
            && self.owners_removed == 0
            && self.files_removed == 0
            && self.directories_removed == 0
            && self.conflicts.is_empty()
    }
}

/// Reconciles directory `path` against the `listed` children `peer` reported.
pub fn merge_directory(
    namespace: &Namespace,
    peer: &PeerName,
    path: &str,
    listed: &[ChildRecord],
    resolver: &dyn ConflictResolver,
    report: &mut RemergeReport,
) -> Result<(), NamespaceError> {
    merge_directory_while(namespace, peer, path, listed, resolver, report, || true)
}

/// Like `merge_directory`, but applies nothing unless `live()` still holds
/// once the directory is locked. A peer removed while its listing is in
/// flight is never written back as an owner.
pub fn merge_directory_while(
    namespace: &Namespace,
    peer: &PeerName,
    path: &str,
    listed: &[ChildRecord],
    resolver: &dyn ConflictResolver,
    report: &mut RemergeReport,
    live: impl Fn() -> bool,
) -> Result<(), NamespaceError> {
    let path = normalize(path)?;
    if !live() {
        return Ok(());
    }
    namespace.create_directory_all(&path)?;
    let node = namespace
        .node(&path)
        .ok_or_else(|| NamespaceError::NotFound(path.clone()))?;

    let listed: BTreeMap<&str, &ChildRecord> = listed
        .iter()
        .filter(|record| !record.name.is_empty() && !record.name.contains('/'))
        .map(|record| (record.name.as_str(), record))
        .collect();

    let mut guard = node.write();
    if !live() {
        tracing::debug!("Listing of {} from {} dropped, peer went away", path, peer);
        return Ok(());
    }
    report.directories += 1;

    // Entries this peer no longer reports.
    let absent: Vec<String> = guard
        .children
        .keys()
        .filter(|name| !listed.contains_key(name.as_str()))
        .cloned()
        .collect();
    for name in absent {
        let child_path = join(&path, &name);
        match guard.children.get_mut(&name) {
            Some(Child::File(meta)) => {
                if meta.owners.remove(peer) {
                    report.owners_removed += 1;
                    if meta.owners.is_empty() {
                        guard.children.remove(&name);
                        report.files_removed += 1;
                        tracing::debug!("{} no longer has {}, removed", peer, child_path);
                    }
                }
            }
            Some(Child::Directory { .. }) => {
                if strip_subtree(namespace, &child_path, peer, report) == Stripped::Emptied {
                    guard.children.remove(&name);
                    namespace.forget_subtree(&child_path);
                    report.directories_removed += 1;
                }
            }
            None => {}
        }
    }

    for (name, record) in listed {
        let child_path = join(&path, name);
        apply_record(
            namespace,
            &mut guard,
            &child_path,
            name,
            record,
            peer,
            resolver,
            report,
        );
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_record(
    namespace: &Namespace,
    node: &mut DirectoryNode,
    child_path: &str,
    name: &str,
    record: &ChildRecord,
    peer: &PeerName,
    resolver: &dyn ConflictResolver,
    report: &mut RemergeReport,
) {
    let existing = node.children.get_mut(name);
    match (existing, record.kind) {
        (None, EntryKind::File) => {
            node.children.insert(
                name.to_string(),
                Child::File(FileMeta::owned_by(
                    record.size,
                    record.checksum,
                    record.modified,
                    peer.clone(),
                )),
            );
            report.files_created += 1;
        }
        (None, EntryKind::Directory) => {
            node.children.insert(
                name.to_string(),
                Child::Directory {
                    modified: record.modified,
                },
            );
            namespace.register_dir(child_path);
            report.directories_created += 1;
        }
        (Some(Child::Directory { .. }), EntryKind::Directory) => {}
        (Some(Child::File(meta)), EntryKind::File) => {
            if meta.matches(record.size, record.checksum) {
                if meta.checksum == 0 && record.checksum != 0 {
                    meta.checksum = record.checksum;
                }
                if meta.owners.insert(peer.clone()) {
                    report.owners_added += 1;
                }
                return;
            }

            let resolution = match resolver.resolve(child_path, meta, record, peer) {
                Resolution::KeptExisting
                    if meta.owners.iter().all(|owner| owner == peer) =>
                {
                    // Nothing else holds the recorded content.
                    Resolution::TookReported
                }
                other => other,
            };
            let conflict = ReconciliationConflict::content(
                child_path.to_string(),
                peer,
                meta,
                record,
                resolution,
            );
            conflict.log();
            report.conflicts.push(conflict);

            match resolution {
                Resolution::TookReported => {
                    report.owners_removed += meta.owners.iter().filter(|o| *o != peer).count();
                    *meta = FileMeta::owned_by(
                        record.size,
                        record.checksum,
                        record.modified,
                        peer.clone(),
                    );
                }
                Resolution::KeptExisting => {
                    if meta.owners.remove(peer) {
                        report.owners_removed += 1;
                    }
                }
            }
        }
        (Some(Child::File(meta)), EntryKind::Directory) => {
            if meta.owners.remove(peer) {
                report.owners_removed += 1;
            }
            let replace = meta.owners.is_empty();
            let resolution = if replace {
                Resolution::TookReported
            } else {
                Resolution::KeptExisting
            };
            let conflict = ReconciliationConflict::types(
                child_path.to_string(),
                peer,
                EntryKind::File,
                record,
                resolution,
            );
            conflict.log();
            report.conflicts.push(conflict);

            if replace {
                node.children.insert(
                    name.to_string(),
                    Child::Directory {
                        modified: record.modified,
                    },
                );
                namespace.register_dir(child_path);
                report.files_removed += 1;
                report.directories_created += 1;
            }
        }
        (Some(Child::Directory { .. }), EntryKind::File) => {
            // An empty directory has no holder, so the reported file takes its place.
            let replace = strip_subtree(namespace, child_path, peer, report) != Stripped::Occupied;
            let resolution = if replace {
                Resolution::TookReported
            } else {
                Resolution::KeptExisting
            };
            let conflict = ReconciliationConflict::types(
                child_path.to_string(),
                peer,
                EntryKind::Directory,
                record,
                resolution,
            );
            conflict.log();
            report.conflicts.push(conflict);

            if replace {
                namespace.forget_subtree(child_path);
                node.children.insert(
                    name.to_string(),
                    Child::File(FileMeta::owned_by(
                        record.size,
                        record.checksum,
                        record.modified,
                        peer.clone(),
                    )),
                );
                report.directories_removed += 1;
                report.files_created += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stripped {
    /// Something other than `peer` still holds content below the directory.
    Occupied,
    /// The directory was empty before `peer` was stripped from it.
    AlreadyEmpty,
    /// Stripping `peer` left the directory empty.
    Emptied,
}

/// Removes `peer` from every file below `path`, dropping files and
/// directories that `peer` leaves empty. Directories that were empty to begin
/// with stay.
fn strip_subtree(
    namespace: &Namespace,
    path: &str,
    peer: &PeerName,
    report: &mut RemergeReport,
) -> Stripped {
    let Some(node) = namespace.node(path) else {
        return Stripped::Emptied;
    };
    let mut guard = node.write();
    if guard.children.is_empty() {
        return Stripped::AlreadyEmpty;
    }

    let mut subdirs = Vec::new();
    guard.children.retain(|name, child| match child {
        Child::File(meta) => {
            if meta.owners.remove(peer) {
                report.owners_removed += 1;
                if meta.owners.is_empty() {
                    report.files_removed += 1;
                    return false;
                }
            }
            true
        }
        Child::Directory { .. } => {
            subdirs.push(name.clone());
            true
        }
    });

    for name in subdirs {
        let child_path = join(path, &name);
        if strip_subtree(namespace, &child_path, peer, report) == Stripped::Emptied {
            guard.children.remove(&name);
            namespace.forget_subtree(&child_path);
            report.directories_removed += 1;
        }
    }

    if guard.children.is_empty() {
        Stripped::Emptied
    } else {
        Stripped::Occupied
    }
}

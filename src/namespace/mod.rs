//! Namespace Module
//!
//! The master's virtual file tree, decoupled from where files physically live.
//!
//! ## Core Concepts
//! - **Per-directory locking**: every directory is its own `RwLock`; there is
//!   no lock over the whole tree.
//! - **Ownership records**: each file carries the set of peers holding a copy.
//!   A file whose last owner goes away is removed.
//! - **Snapshots**: the tree and the peer definitions are persisted as JSON and
//!   reloaded at startup as a cache of what the next remerge will confirm.

pub mod persist;
pub mod tree;
pub mod types;

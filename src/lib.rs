//! Storage Coordinator Library
//!
//! The master side of a distributed file-serving daemon. Clients talk to the
//! master; files live on a pool of storage peers that can join, leave or fail
//! at any time. This crate keeps track of those peers and decides which of
//! them stores or serves each file.
//!
//! ## Architecture Modules
//!
//! - **`peer`**: Registry of storage peers, their connection workers and the
//!   rolling error window that decides when a peer is taken offline.
//! - **`protocol`**: The indexed request/response protocol. Framing, the
//!   correlation index pool, handshake and extension negotiation, issuers on
//!   the master side and handlers on the peer side.
//! - **`selection`**: Filter chains over a score chart that rank healthy peers
//!   for a store, retrieve or replication decision.
//! - **`namespace`**: The virtual directory tree with per-file ownership
//!   records, plus its on-disk snapshot.
//! - **`remerge`**: Reconciles the namespace with the listing a peer streams
//!   after it connects.
//! - **`coordinator`**: Ties everything together behind client and admin
//!   calls, runs the reconnect and snapshot loops and serves the admin HTTP API.
//! - **`config`**: TOML configuration with environment overrides.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod namespace;
pub mod peer;
pub mod protocol;
pub mod remerge;
pub mod selection;

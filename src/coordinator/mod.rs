//! Coordinator Module
//!
//! The master's outward face. Wires the peer registry, the namespace, the
//! selection engine and remerge together and exposes:
//!
//! - **Client-facing calls**: peer selection for stores, retrieves and
//!   replication, owner lookups, peer availability.
//! - **Administrative surface**: add and remove peers, replace filter chains,
//!   force a remerge. Served over HTTP by `handlers`.
//! - **Background tasks**: a reconnect supervisor for dropped peers and a
//!   periodic snapshot of peers and namespace.

pub mod handlers;
pub mod service;

#[cfg(test)]
mod tests;

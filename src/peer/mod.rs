//! Peer Connection & Health
//!
//! Tracks every storage peer the master knows about and the one connection it
//! holds to each of them.
//!
//! ## Core Mechanisms
//! - **Connection workers**: after the handshake a reader and a writer task own
//!   the stream; callers only touch queues and oneshot channels.
//! - **Health window**: network errors are counted in a rolling window; one
//!   error past the threshold takes the peer offline.
//! - **Keepalive**: a quiet connection is pinged at half the response timeout
//!   (`Degraded`) and dropped at the full timeout (`Offline`).
//! - **Events**: every state transition is broadcast as a `PeerEvent`.

pub mod connection;
pub mod health;
pub mod registry;
pub mod remote;
pub mod types;

#[cfg(test)]
mod tests;

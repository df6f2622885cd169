//! Indexed Async RPC
//!
//! Wire protocol between the master and its storage peers.
//!
//! ## Core Mechanisms
//! - **Framing**: every message is a bincode payload behind a big-endian `u32`
//!   length prefix.
//! - **Handshake**: the master announces its ordered list of extensions; the
//!   peer answers once with success or a failure reason.
//! - **Correlation indices**: each command carries an index from a bounded
//!   pool, so responses may come back in any order.
//! - **Extensions**: `basic` and `transfer` issuers on the master side, the
//!   matching `Handler`s on the peer side.

pub mod central;
pub mod codec;
pub mod endpoint;
pub mod envelope;
pub mod handler;
pub mod index;
pub mod issuer;

#[cfg(test)]
pub(crate) mod testing;

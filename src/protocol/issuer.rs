//! Caller-side helpers, one per protocol extension.
//!
//! An issuer knows the command names and argument layout of its extension and
//! turns the peer's typed response back into a Rust value. All traffic goes
//! through `RemotePeer::issue` / `RemotePeer::fetch_response`, so health
//! bookkeeping applies to every command.

use super::envelope::{CorrelationIndex, ResponseBody, TransferStatus};
use crate::error::RpcError;
use crate::peer::remote::RemotePeer;
use crate::peer::types::DiskStatus;
use std::time::Duration;

/// A named family of commands that must be negotiated at handshake time.
pub trait Issuer: Send + Sync {
    fn extension(&self) -> &'static str;
    fn commands(&self) -> &'static [&'static str];
}

pub mod basic {
    pub const EXTENSION: &str = "basic";
    pub const PING: &str = "ping";
    pub const CHECKSUM: &str = "checksum";
    pub const DELETE: &str = "delete";
    pub const RENAME: &str = "rename";
    pub const REMERGE: &str = "remerge";
    pub const REMERGE_PAUSE: &str = "remergePause";
    pub const REMERGE_RESUME: &str = "remergeResume";
    pub const DISK_STATUS: &str = "diskStatus";

    pub const COMMANDS: &[&str] = &[
        PING,
        CHECKSUM,
        DELETE,
        RENAME,
        REMERGE,
        REMERGE_PAUSE,
        REMERGE_RESUME,
        DISK_STATUS,
    ];
}

pub mod transfer {
    pub const EXTENSION: &str = "transfer";
    pub const TRANSFER_STATUS: &str = "transferStatus";
    pub const ABORT_TRANSFER: &str = "abortTransfer";

    pub const COMMANDS: &[&str] = &[TRANSFER_STATUS, ABORT_TRANSFER];
}

fn unexpected(command: &str, body: &ResponseBody) -> RpcError {
    RpcError::UnexpectedResponse {
        command: command.to_string(),
        detail: format!("got {} body", body.kind()),
    }
}

/// Commands every peer must understand.
#[derive(Debug, Default)]
pub struct BasicIssuer;

impl Issuer for BasicIssuer {
    fn extension(&self) -> &'static str {
        basic::EXTENSION
    }

    fn commands(&self) -> &'static [&'static str] {
        basic::COMMANDS
    }
}

impl BasicIssuer {
    pub async fn issue_ping(&self, peer: &RemotePeer) -> Result<CorrelationIndex, RpcError> {
        peer.issue(basic::EXTENSION, basic::PING, Vec::new()).await
    }

    pub async fn issue_checksum(
        &self,
        peer: &RemotePeer,
        path: &str,
    ) -> Result<CorrelationIndex, RpcError> {
        peer.issue(basic::EXTENSION, basic::CHECKSUM, vec![path.to_string()])
            .await
    }

    pub async fn issue_delete(
        &self,
        peer: &RemotePeer,
        path: &str,
    ) -> Result<CorrelationIndex, RpcError> {
        peer.issue(basic::EXTENSION, basic::DELETE, vec![path.to_string()])
            .await
    }

    pub async fn issue_rename(
        &self,
        peer: &RemotePeer,
        from: &str,
        to_dir: &str,
        to_name: &str,
    ) -> Result<CorrelationIndex, RpcError> {
        peer.issue(
            basic::EXTENSION,
            basic::RENAME,
            vec![from.to_string(), to_dir.to_string(), to_name.to_string()],
        )
        .await
    }

    /// Asks the peer to stream a recursive listing of `path`.
    pub async fn issue_remerge(
        &self,
        peer: &RemotePeer,
        path: &str,
    ) -> Result<CorrelationIndex, RpcError> {
        peer.issue(basic::EXTENSION, basic::REMERGE, vec![path.to_string()])
            .await
    }

    pub async fn issue_remerge_pause(
        &self,
        peer: &RemotePeer,
    ) -> Result<CorrelationIndex, RpcError> {
        peer.issue(basic::EXTENSION, basic::REMERGE_PAUSE, Vec::new())
            .await
    }

    pub async fn issue_remerge_resume(
        &self,
        peer: &RemotePeer,
    ) -> Result<CorrelationIndex, RpcError> {
        peer.issue(basic::EXTENSION, basic::REMERGE_RESUME, Vec::new())
            .await
    }

    pub async fn issue_disk_status(
        &self,
        peer: &RemotePeer,
    ) -> Result<CorrelationIndex, RpcError> {
        peer.issue(basic::EXTENSION, basic::DISK_STATUS, Vec::new())
            .await
    }

    /// Round-trip ping bounded by `timeout`.
    pub async fn ping(&self, peer: &RemotePeer, timeout: Duration) -> Result<(), RpcError> {
        let index = self.issue_ping(peer).await?;
        match peer.fetch_response_within(index, timeout).await? {
            ResponseBody::Pong => Ok(()),
            other => Err(unexpected(basic::PING, &other)),
        }
    }

    pub async fn checksum(&self, peer: &RemotePeer, path: &str) -> Result<u64, RpcError> {
        let index = self.issue_checksum(peer, path).await?;
        match peer.fetch_response(index).await? {
            ResponseBody::Checksum(sum) => Ok(sum),
            other => Err(unexpected(basic::CHECKSUM, &other)),
        }
    }

    pub async fn delete(&self, peer: &RemotePeer, path: &str) -> Result<(), RpcError> {
        let index = self.issue_delete(peer, path).await?;
        peer.fetch_response(index).await.map(|_| ())
    }

    pub async fn rename(
        &self,
        peer: &RemotePeer,
        from: &str,
        to_dir: &str,
        to_name: &str,
    ) -> Result<(), RpcError> {
        let index = self.issue_rename(peer, from, to_dir, to_name).await?;
        peer.fetch_response(index).await.map(|_| ())
    }

    /// Starts a listing stream of `path`. The frames arrive unsolicited.
    pub async fn remerge(&self, peer: &RemotePeer, path: &str) -> Result<(), RpcError> {
        let index = self.issue_remerge(peer, path).await?;
        peer.fetch_response(index).await.map(|_| ())
    }

    pub async fn remerge_pause(&self, peer: &RemotePeer) -> Result<(), RpcError> {
        let index = self.issue_remerge_pause(peer).await?;
        peer.fetch_response(index).await.map(|_| ())
    }

    pub async fn remerge_resume(&self, peer: &RemotePeer) -> Result<(), RpcError> {
        let index = self.issue_remerge_resume(peer).await?;
        peer.fetch_response(index).await.map(|_| ())
    }

    pub async fn disk_status(&self, peer: &RemotePeer) -> Result<DiskStatus, RpcError> {
        let index = self.issue_disk_status(peer).await?;
        match peer.fetch_response(index).await? {
            ResponseBody::DiskStatus(status) => {
                peer.set_disk_status(status);
                Ok(status)
            }
            other => Err(unexpected(basic::DISK_STATUS, &other)),
        }
    }
}

/// Transfer bookkeeping commands.
#[derive(Debug, Default)]
pub struct TransferIssuer;

impl Issuer for TransferIssuer {
    fn extension(&self) -> &'static str {
        transfer::EXTENSION
    }

    fn commands(&self) -> &'static [&'static str] {
        transfer::COMMANDS
    }
}

impl TransferIssuer {
    pub async fn transfer_status(
        &self,
        peer: &RemotePeer,
        transfer_id: &str,
    ) -> Result<TransferStatus, RpcError> {
        let index = peer
            .issue(
                transfer::EXTENSION,
                transfer::TRANSFER_STATUS,
                vec![transfer_id.to_string()],
            )
            .await?;
        match peer.fetch_response(index).await? {
            ResponseBody::TransferStatus(status) => Ok(status),
            other => Err(unexpected(transfer::TRANSFER_STATUS, &other)),
        }
    }

    pub async fn abort_transfer(
        &self,
        peer: &RemotePeer,
        transfer_id: &str,
        reason: &str,
    ) -> Result<(), RpcError> {
        let index = peer
            .issue(
                transfer::EXTENSION,
                transfer::ABORT_TRANSFER,
                vec![transfer_id.to_string(), reason.to_string()],
            )
            .await?;
        peer.fetch_response(index).await.map(|_| ())
    }
}

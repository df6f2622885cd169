//! Callee-side dispatch, as run by a storage peer.
//!
//! Each extension contributes one `Handler`. The registry maps command names
//! to the handler that owns them, so a command arriving over the wire is a
//! single table lookup. Local failures come back as `RemoteError` and are
//! wrapped into the response envelope instead of travelling on a side channel.

use super::envelope::{ListingFrame, PeerMessage, RemoteError, RemoteErrorKind, ResponseBody};
use crate::peer::types::DiskStatus;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lets a handler push unsolicited frames (listings, disk status) to the master.
#[derive(Clone)]
pub struct HandlerContext {
    outbound: mpsc::UnboundedSender<PeerMessage>,
}

impl HandlerContext {
    pub fn new(outbound: mpsc::UnboundedSender<PeerMessage>) -> Self {
        Self { outbound }
    }

    pub fn send_listing(&self, frame: ListingFrame) -> bool {
        self.outbound.send(PeerMessage::Listing(frame)).is_ok()
    }

    pub fn send_disk_status(&self, status: DiskStatus) -> bool {
        self.outbound.send(PeerMessage::DiskStatus(status)).is_ok()
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    fn extension(&self) -> &'static str;
    fn commands(&self) -> &'static [&'static str];

    async fn handle(
        &self,
        ctx: &HandlerContext,
        command: &str,
        args: &[String],
    ) -> Result<ResponseBody, RemoteError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    by_command: HashMap<String, Arc<dyn Handler>>,
    extensions: Vec<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        let extension = handler.extension().to_string();
        for command in handler.commands() {
            self.by_command.insert(command.to_string(), handler.clone());
        }
        if !self.extensions.contains(&extension) {
            tracing::debug!("Registered handler for extension {}", extension);
            self.extensions.push(extension);
        }
    }

    pub fn supports(&self, extension: &str) -> bool {
        self.extensions.iter().any(|e| e == extension)
    }

    /// First requested extension this registry cannot serve.
    pub fn first_missing<'a>(&self, requested: &'a [String]) -> Option<&'a str> {
        requested
            .iter()
            .find(|ext| !self.supports(ext))
            .map(String::as_str)
    }

    pub async fn dispatch(
        &self,
        ctx: &HandlerContext,
        command: &str,
        args: &[String],
    ) -> Result<ResponseBody, RemoteError> {
        match self.by_command.get(command) {
            Some(handler) => handler.handle(ctx, command, args).await,
            None => Err(RemoteError::new(
                RemoteErrorKind::Unsupported,
                format!("unknown command: {}", command),
            )),
        }
    }
}

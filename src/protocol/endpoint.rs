//! Peer side of a connection.
//!
//! Answers the master's handshake against the local handler registry, then
//! serves commands concurrently: every command runs on its own task, so
//! responses leave in completion order rather than issue order.

use super::codec::{read_frame, write_frame};
use super::envelope::{
    CommandEnvelope, HandshakeRequest, HandshakeResponse, PeerMessage, ResponseEnvelope,
};
use super::handler::{HandlerContext, HandlerRegistry};
use crate::peer::types::{DiskStatus, PeerName};

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

pub struct PeerEndpoint {
    name: PeerName,
    credentials: Option<String>,
    handlers: Arc<HandlerRegistry>,
    initial_disk: Option<DiskStatus>,
}

impl PeerEndpoint {
    pub fn new(name: PeerName, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            name,
            credentials: None,
            handlers,
            initial_disk: None,
        }
    }

    pub fn with_credentials(mut self, credentials: impl Into<String>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }

    /// Disk status pushed right after a successful handshake.
    pub fn with_disk_status(mut self, status: DiskStatus) -> Self {
        self.initial_disk = Some(status);
        self
    }

    fn verdict(&self, request: &HandshakeRequest) -> HandshakeResponse {
        if request.peer != self.name {
            return HandshakeResponse::rejected(format!(
                "this is {}, not {}",
                self.name, request.peer
            ));
        }
        if self.credentials.is_some() && request.credentials != self.credentials {
            return HandshakeResponse::rejected("bad credentials");
        }
        if let Some(missing) = self.handlers.first_missing(&request.extensions) {
            return HandshakeResponse::rejected(format!(
                "missing protocol extension: {}",
                missing
            ));
        }
        HandshakeResponse::accepted()
    }

    /// Runs until the master closes the stream.
    pub async fn serve<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let request: HandshakeRequest = match read_frame(&mut reader).await? {
            Some(request) => request,
            None => return Ok(()),
        };
        let verdict = self.verdict(&request);
        write_frame(&mut writer, &verdict).await?;
        if !verdict.success {
            tracing::warn!(
                "Refused master handshake: {}",
                verdict.failure.unwrap_or_default()
            );
            return Ok(());
        }

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<PeerMessage>();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &message).await {
                    tracing::warn!("Peer failed to write to master: {}", e);
                    break;
                }
            }
        });

        let ctx = HandlerContext::new(outbound.clone());
        if let Some(status) = self.initial_disk {
            ctx.send_disk_status(status);
        }

        loop {
            let command: CommandEnvelope = match read_frame(&mut reader).await {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Peer failed to read from master: {}", e);
                    break;
                }
            };

            let handlers = self.handlers.clone();
            let ctx = ctx.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                let outcome = handlers
                    .dispatch(&ctx, &command.command, &command.args)
                    .await;
                let _ = outbound.send(PeerMessage::Response(ResponseEnvelope {
                    index: command.index,
                    outcome,
                }));
            });
        }

        drop(ctx);
        drop(outbound);
        writer_task.abort();
        Ok(())
    }
}

//! Registry of loaded protocol extensions and the connection handshake.
//!
//! Extensions are registered explicitly at startup; the ordered list of their
//! names is what the master announces to every peer. A peer that cannot serve
//! all of them is refused before any command is issued.

use super::codec::{read_frame, write_frame};
use super::envelope::{HandshakeRequest, HandshakeResponse};
use super::index::DEFAULT_POOL_SIZE;
use super::issuer::{BasicIssuer, Issuer, TransferIssuer};
use crate::error::PeerError;
use crate::peer::types::PeerDefinition;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Knobs of the request/response layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RpcSettings {
    pub index_pool_size: u32,
    pub handshake_timeout: Duration,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            index_pool_size: DEFAULT_POOL_SIZE,
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

pub struct ProtocolCentral {
    extensions: Vec<String>,
    issuers: HashMap<String, Arc<dyn Issuer>>,
    basic: Arc<BasicIssuer>,
    transfer: Arc<TransferIssuer>,
}

impl ProtocolCentral {
    /// Loads the built-in extensions in their fixed order.
    pub fn builtin() -> Arc<Self> {
        let basic = Arc::new(BasicIssuer);
        let transfer = Arc::new(TransferIssuer);

        let mut central = Self {
            extensions: Vec::new(),
            issuers: HashMap::new(),
            basic: basic.clone(),
            transfer: transfer.clone(),
        };
        central.register(basic);
        central.register(transfer);

        for name in &central.extensions {
            tracing::debug!("Protocol extension loaded: {}", name);
        }

        Arc::new(central)
    }

    fn register(&mut self, issuer: Arc<dyn Issuer>) {
        let name = issuer.extension().to_string();
        if !self.extensions.contains(&name) {
            self.extensions.push(name.clone());
        }
        self.issuers.entry(name).or_insert(issuer);
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn issuer(&self, extension: &str) -> Option<Arc<dyn Issuer>> {
        self.issuers.get(extension).cloned()
    }

    pub fn basic(&self) -> &BasicIssuer {
        &self.basic
    }

    pub fn transfer(&self) -> &TransferIssuer {
        &self.transfer
    }

    /// Announces the loaded extensions and waits for the peer's verdict.
    ///
    /// Must run to completion on a fresh stream before anything else is
    /// written to it.
    pub async fn handshake<S>(
        &self,
        stream: &mut S,
        peer: &PeerDefinition,
        timeout: Duration,
    ) -> Result<(), PeerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let failed = |reason: String| PeerError::HandshakeError {
            peer: peer.name.clone(),
            reason,
        };

        tracing::debug!("Handshaking with {} ({:?})", peer.name, self.extensions);

        let request = HandshakeRequest {
            peer: peer.name.clone(),
            credentials: peer.credentials.clone(),
            extensions: self.extensions.clone(),
        };

        let exchange = async {
            write_frame(stream, &request).await?;
            read_frame::<_, HandshakeResponse>(stream).await
        };

        let response = match tokio::time::timeout(timeout, exchange).await {
            Err(_) => return Err(failed(format!("no response within {:?}", timeout))),
            Ok(Err(e)) => return Err(failed(e.to_string())),
            Ok(Ok(None)) => return Err(failed("connection closed during handshake".into())),
            Ok(Ok(Some(response))) => response,
        };

        if !response.success {
            let reason = response
                .failure
                .unwrap_or_else(|| "peer refused the handshake".to_string());
            tracing::warn!("Handshake with {} refused: {}", peer.name, reason);
            return Err(failed(reason));
        }

        tracing::debug!("Handshake with {} successful", peer.name);
        Ok(())
    }
}

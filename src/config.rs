//! Master configuration: a TOML file, then `COORDINATOR_*` environment
//! overrides, then command-line flags (applied by the binary).

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::peer::types::{HealthSettings, PeerDefinition};
use crate::protocol::central::RpcSettings;
use crate::protocol::index::DEFAULT_POOL_SIZE;
use crate::remerge::RemergeSettings;
use crate::selection::manager::SelectionConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub error_window_secs: u64,
    pub max_errors: usize,
    pub response_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            error_window_secs: 60,
            max_errors: 5,
            response_timeout_secs: 60,
        }
    }
}

impl HealthConfig {
    pub fn settings(&self) -> HealthSettings {
        HealthSettings {
            error_window: Duration::from_secs(self.error_window_secs.max(1)),
            max_errors: self.max_errors,
            response_timeout: Duration::from_secs(self.response_timeout_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RpcConfig {
    pub index_pool_size: u32,
    pub handshake_timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            index_pool_size: DEFAULT_POOL_SIZE,
            handshake_timeout_secs: 30,
        }
    }
}

impl RpcConfig {
    pub fn settings(&self) -> RpcSettings {
        RpcSettings {
            index_pool_size: self.index_pool_size.max(1),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MasterConfig {
    /// Listen address of the admin HTTP surface.
    pub admin_addr: SocketAddr,
    /// Snapshot file; `None` disables persistence.
    pub state_path: Option<PathBuf>,
    pub snapshot_interval_secs: u64,
    pub reconnect_interval_secs: u64,
    pub health: HealthConfig,
    pub rpc: RpcConfig,
    pub remerge: RemergeSettings,
    pub selection: SelectionConfig,
    /// Peers registered at startup, in addition to those in the snapshot.
    pub peers: Vec<PeerDefinition>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            admin_addr: SocketAddr::from(([127, 0, 0, 1], 7400)),
            state_path: Some(PathBuf::from("data/coordinator-state.json")),
            snapshot_interval_secs: 300,
            reconnect_interval_secs: 30,
            health: HealthConfig::default(),
            rpc: RpcConfig::default(),
            remerge: RemergeSettings::default(),
            selection: SelectionConfig::default(),
            peers: Vec::new(),
        }
    }
}

impl MasterConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs.max(1))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs.max(1))
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `COORDINATOR_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parsed<T: std::str::FromStr>(key: &str, raw: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| anyhow!("invalid value for {}: {} ({})", key, raw, e))
        }

        if let Some(raw) = lookup("COORDINATOR_ADMIN_ADDR") {
            self.admin_addr = parsed("COORDINATOR_ADMIN_ADDR", raw)?;
        }
        if let Some(raw) = lookup("COORDINATOR_STATE_PATH") {
            self.state_path = if raw.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(raw))
            };
        }
        if let Some(raw) = lookup("COORDINATOR_SNAPSHOT_INTERVAL_SECS") {
            self.snapshot_interval_secs = parsed("COORDINATOR_SNAPSHOT_INTERVAL_SECS", raw)?;
        }
        if let Some(raw) = lookup("COORDINATOR_RECONNECT_INTERVAL_SECS") {
            self.reconnect_interval_secs = parsed("COORDINATOR_RECONNECT_INTERVAL_SECS", raw)?;
        }
        if let Some(raw) = lookup("COORDINATOR_MAX_ERRORS") {
            self.health.max_errors = parsed("COORDINATOR_MAX_ERRORS", raw)?;
        }
        if let Some(raw) = lookup("COORDINATOR_RESPONSE_TIMEOUT_SECS") {
            self.health.response_timeout_secs = parsed("COORDINATOR_RESPONSE_TIMEOUT_SECS", raw)?;
        }
        if let Some(raw) = lookup("COORDINATOR_CONFLICT") {
            self.remerge.conflict = parsed("COORDINATOR_CONFLICT", raw)?;
        }
        Ok(())
    }
}

/// Reads `path`; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<MasterConfig> {
    if !path.exists() {
        tracing::info!("No config at {}, using defaults", path.display());
        return Ok(MasterConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: MasterConfig =
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

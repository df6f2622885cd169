use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::peer::types::{Direction, PeerName};

/// Everything a filter may look at to make its decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionContext {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub source_addr: Option<IpAddr>,
    pub direction: Direction,
    pub path: String,
    /// Expected size for stores, when known.
    #[serde(default)]
    pub size: Option<u64>,
    /// For replication: the peer the copy comes from.
    #[serde(default)]
    pub source_peer: Option<PeerName>,
    /// Peers that must not be chosen (already hold the file, or are targets).
    #[serde(default)]
    pub exclude: BTreeSet<PeerName>,
}

impl SelectionContext {
    pub fn store(path: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            user: None,
            source_addr: None,
            direction: Direction::Store,
            path: path.into(),
            size,
            source_peer: None,
            exclude: BTreeSet::new(),
        }
    }

    pub fn retrieve(path: impl Into<String>) -> Self {
        Self {
            direction: Direction::Retrieve,
            ..Self::store(path, None)
        }
    }
}

/// The decision a chain is configured for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChainKind {
    Store,
    Retrieve,
    /// Replication destination.
    JobStore,
    /// Replication source.
    JobRetrieve,
}

impl ChainKind {
    pub const ALL: [ChainKind; 4] = [
        ChainKind::Store,
        ChainKind::Retrieve,
        ChainKind::JobStore,
        ChainKind::JobRetrieve,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChainKind::Store => "store",
            ChainKind::Retrieve => "retrieve",
            ChainKind::JobStore => "job_store",
            ChainKind::JobRetrieve => "job_retrieve",
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            ChainKind::Store | ChainKind::JobStore => Direction::Store,
            ChainKind::Retrieve | ChainKind::JobRetrieve => Direction::Retrieve,
        }
    }

    pub fn is_job(self) -> bool {
        matches!(self, ChainKind::JobStore | ChainKind::JobRetrieve)
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChainKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownChain(s.to_string()))
    }
}

/// One configured filter: `{ filter = "minfreespace", reserve = "1GB" }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterSpec {
    pub filter: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, toml::Value>,
}

impl FilterSpec {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params
            .insert(key.to_string(), toml::Value::String(value.into()));
        self
    }

    /// Parameter as text, whatever its configured type.
    pub fn param(&self, key: &str) -> Option<String> {
        match self.params.get(key)? {
            toml::Value::String(s) => Some(s.clone()),
            toml::Value::Integer(i) => Some(i.to_string()),
            toml::Value::Float(f) => Some(f.to_string()),
            toml::Value::Boolean(b) => Some(b.to_string()),
            other => Some(other.to_string()),
        }
    }

    pub fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.param(key).ok_or_else(|| ConfigError::MissingParameter {
            filter: self.filter.clone(),
            param: key.to_string(),
        })
    }

    pub fn bad(&self, key: &str, value: &str) -> ConfigError {
        ConfigError::BadParameter {
            filter: self.filter.clone(),
            param: key.to_string(),
            value: value.to_string(),
        }
    }

    /// Parses `key` as `T`, falling back to `default` when absent.
    pub fn parsed_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.param(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| self.bad(key, &raw)),
        }
    }

    pub fn size_or(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.param(key) {
            None => Ok(default),
            Some(raw) => parse_size(&raw).ok_or_else(|| self.bad(key, &raw)),
        }
    }
}

/// Parses `1024`, `10KB`, `1.5GB`, `2TiB`... Units are powers of 1024.
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return None,
    };
    if number < 0.0 {
        return None;
    }
    Some((number * multiplier as f64) as u64)
}

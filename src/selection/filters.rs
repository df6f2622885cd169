//! Built-in filters.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use super::chart::ScoreChart;
use super::filter::{Filter, FilterEnv};
use super::types::{FilterSpec, SelectionContext};
use crate::error::ConfigError;
use crate::peer::types::{Direction, PeerName};
use crate::protocol::central::ProtocolCentral;

const GIB: u64 = 1 << 30;

/// Eliminates peers that cannot fit the file plus a reserve. Stores only.
///
/// Params: `reserve` (size, default 0), `bonus` (score per free GiB, default 0).
pub struct MinFreeSpace {
    reserve: u64,
    bonus: i64,
}

impl MinFreeSpace {
    pub fn build(spec: &FilterSpec, _: &FilterEnv) -> Result<Box<dyn Filter>, ConfigError> {
        Ok(Box::new(Self {
            reserve: spec.size_or("reserve", 0)?,
            bonus: spec.parsed_or("bonus", 0)?,
        }))
    }
}

#[async_trait]
impl Filter for MinFreeSpace {
    fn name(&self) -> &'static str {
        "minfreespace"
    }

    async fn process(&self, chart: &mut ScoreChart, ctx: &SelectionContext) {
        if ctx.direction != Direction::Store {
            return;
        }
        let needed = self.reserve.saturating_add(ctx.size.unwrap_or(0));
        chart.retain("not enough free space", |entry| {
            entry
                .peer
                .disk_status()
                .map(|disk| disk.free_bytes >= needed)
                .unwrap_or(false)
        });
        if self.bonus != 0 {
            chart.score_each(|entry| {
                let free = entry.peer.disk_status().map(|d| d.free_bytes).unwrap_or(0);
                let spare = free.saturating_sub(needed) / GIB;
                (spare as i64).saturating_mul(self.bonus)
            });
        }
    }
}

/// Eliminates peers already running `max` transfers.
pub struct MaxTransfers {
    max: usize,
}

impl MaxTransfers {
    pub fn build(spec: &FilterSpec, _: &FilterEnv) -> Result<Box<dyn Filter>, ConfigError> {
        let raw = spec.required("max")?;
        let max = raw.trim().parse().map_err(|_| spec.bad("max", &raw))?;
        Ok(Box::new(Self { max }))
    }
}

#[async_trait]
impl Filter for MaxTransfers {
    fn name(&self) -> &'static str {
        "maxtransfers"
    }

    async fn process(&self, chart: &mut ScoreChart, _: &SelectionContext) {
        chart.retain("at transfer cap", |entry| {
            entry.peer.active_transfers() < self.max
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Target {
    All,
    Peer(PeerName),
}

#[derive(Debug, Clone, PartialEq)]
enum Effect {
    Add(i64),
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
struct Assignment {
    target: Target,
    effect: Effect,
}

/// `alpha+100`, `beta-50`, `gamma-remove`, `all-10`, separated by commas or spaces.
fn parse_assign(spec: &FilterSpec, raw: &str) -> Result<Vec<Assignment>, ConfigError> {
    let mut assignments = Vec::new();
    for token in raw.split([',', ' ']).filter(|t| !t.is_empty()) {
        let bad = || spec.bad("assign", token);
        let (pos, add) = match token.find('+') {
            Some(pos) => (pos, true),
            None => (token.find('-').ok_or_else(bad)?, false),
        };
        let name = &token[..pos];
        if name.is_empty() {
            return Err(bad());
        }
        let target = if name.eq_ignore_ascii_case("all") {
            Target::All
        } else {
            Target::Peer(PeerName::new(name))
        };
        let value = &token[pos + 1..];
        let effect = if value == "remove" {
            Effect::Remove
        } else {
            let amount: i64 = value.parse().map_err(|_| bad())?;
            Effect::Add(if add { amount } else { -amount })
        };
        assignments.push(Assignment { target, effect });
    }
    if assignments.is_empty() {
        return Err(spec.bad("assign", raw));
    }
    Ok(assignments)
}

/// Applies score assignments to paths matching a glob.
///
/// Params: `match` (glob on the full path), `assign` (see `parse_assign`).
pub struct MatchDir {
    pattern: glob::Pattern,
    assignments: Vec<Assignment>,
}

impl MatchDir {
    pub fn build(spec: &FilterSpec, _: &FilterEnv) -> Result<Box<dyn Filter>, ConfigError> {
        let raw_pattern = spec.required("match")?;
        let pattern =
            glob::Pattern::new(&raw_pattern).map_err(|_| spec.bad("match", &raw_pattern))?;
        let assignments = parse_assign(spec, &spec.required("assign")?)?;
        Ok(Box::new(Self {
            pattern,
            assignments,
        }))
    }
}

#[async_trait]
impl Filter for MatchDir {
    fn name(&self) -> &'static str {
        "matchdir"
    }

    async fn process(&self, chart: &mut ScoreChart, ctx: &SelectionContext) {
        if !self.pattern.matches(&ctx.path) {
            return;
        }
        for assignment in &self.assignments {
            match (&assignment.target, &assignment.effect) {
                (Target::All, Effect::Remove) => chart.retain("matchdir all-remove", |_| false),
                (Target::All, Effect::Add(delta)) => chart.score_each(|_| *delta),
                (Target::Peer(name), Effect::Remove) => {
                    chart.remove(name, "matchdir remove");
                }
                // Not a candidate is fine.
                (Target::Peer(name), Effect::Add(delta)) => chart.add_score(name, *delta),
            }
        }
    }
}

/// Penalises every active transfer. Param: `penalty` (default 100).
pub struct Transfers {
    penalty: i64,
}

impl Transfers {
    pub fn build(spec: &FilterSpec, _: &FilterEnv) -> Result<Box<dyn Filter>, ConfigError> {
        Ok(Box::new(Self {
            penalty: spec.parsed_or("penalty", 100)?,
        }))
    }
}

#[async_trait]
impl Filter for Transfers {
    fn name(&self) -> &'static str {
        "transfers"
    }

    async fn process(&self, chart: &mut ScoreChart, _: &SelectionContext) {
        chart.score_each(|entry| -(entry.peer.active_transfers() as i64).saturating_mul(self.penalty));
    }
}

/// One point to the peer that transferred in this direction longest ago.
pub struct Cycle;

impl Cycle {
    pub fn build(_: &FilterSpec, _: &FilterEnv) -> Result<Box<dyn Filter>, ConfigError> {
        Ok(Box::new(Self))
    }
}

#[async_trait]
impl Filter for Cycle {
    fn name(&self) -> &'static str {
        "cycle"
    }

    async fn process(&self, chart: &mut ScoreChart, ctx: &SelectionContext) {
        // Candidates come in name order, so ties go to the first name.
        let oldest = chart
            .candidates()
            .min_by_key(|entry| entry.peer.last_transfer(ctx.direction))
            .map(|entry| entry.name().clone());
        if let Some(name) = oldest {
            chart.add_score(&name, 1);
        }
    }
}

/// Adds the peer's `priority` property times `multiplier` (default 1).
pub struct Priority {
    multiplier: i64,
}

impl Priority {
    pub fn build(spec: &FilterSpec, _: &FilterEnv) -> Result<Box<dyn Filter>, ConfigError> {
        Ok(Box::new(Self {
            multiplier: spec.parsed_or("multiplier", 1)?,
        }))
    }
}

#[async_trait]
impl Filter for Priority {
    fn name(&self) -> &'static str {
        "priority"
    }

    async fn process(&self, chart: &mut ScoreChart, _: &SelectionContext) {
        chart.score_each(|entry| {
            entry
                .peer
                .property("priority")
                .and_then(|p| p.trim().parse::<i64>().ok())
                .unwrap_or(0)
                .saturating_mul(self.multiplier)
        });
    }
}

/// Live round trip to every candidate; peers that do not answer within
/// `timeout_ms` (default 1000) are eliminated. Timeouts count toward the
/// peer's error window.
pub struct Ping {
    timeout: Duration,
    central: Arc<ProtocolCentral>,
}

impl Ping {
    pub fn build(spec: &FilterSpec, env: &FilterEnv) -> Result<Box<dyn Filter>, ConfigError> {
        let millis: u64 = spec.parsed_or("timeout_ms", 1000)?;
        if millis == 0 {
            return Err(spec.bad("timeout_ms", "0"));
        }
        Ok(Box::new(Self {
            timeout: Duration::from_millis(millis),
            central: env.central.clone(),
        }))
    }
}

#[async_trait]
impl Filter for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn process(&self, chart: &mut ScoreChart, _: &SelectionContext) {
        let mut probes = JoinSet::new();
        for peer in chart.peers() {
            let central = self.central.clone();
            let timeout = self.timeout;
            probes.spawn(async move {
                let ok = central.basic().ping(&peer, timeout).await.is_ok();
                if !ok {
                    tracing::warn!("Ping to {} failed during selection", peer.name());
                }
                (peer.name().clone(), ok)
            });
        }
        while let Some(result) = probes.join_next().await {
            if let Ok((name, false)) = result {
                chart.remove(&name, "did not answer ping");
            }
        }
    }
}

/// Score proportional to free space: `multiplier` (default 1) per free GiB.
pub struct FreeSpace {
    multiplier: i64,
}

impl FreeSpace {
    pub fn build(spec: &FilterSpec, _: &FilterEnv) -> Result<Box<dyn Filter>, ConfigError> {
        Ok(Box::new(Self {
            multiplier: spec.parsed_or("multiplier", 1)?,
        }))
    }
}

#[async_trait]
impl Filter for FreeSpace {
    fn name(&self) -> &'static str {
        "freespace"
    }

    async fn process(&self, chart: &mut ScoreChart, _: &SelectionContext) {
        chart.score_each(|entry| {
            let free = entry.peer.disk_status().map(|d| d.free_bytes).unwrap_or(0);
            ((free / GIB) as i64).saturating_mul(self.multiplier)
        });
    }
}

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::chart::{ScoreChart, ScoredPeer};
use super::filter::{Filter, FilterEnv, FilterRegistry};
use super::types::{ChainKind, FilterSpec, SelectionContext};
use crate::error::{ConfigError, NoPeerReason, SelectionError};
use crate::peer::remote::RemotePeer;

/// Filter lists per decision kind, as configured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SelectionConfig {
    pub store: Vec<FilterSpec>,
    pub retrieve: Vec<FilterSpec>,
    pub job_store: Vec<FilterSpec>,
    pub job_retrieve: Vec<FilterSpec>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        let store = vec![
            FilterSpec::new("minfreespace"),
            FilterSpec::new("transfers"),
            FilterSpec::new("cycle"),
        ];
        let retrieve = vec![FilterSpec::new("transfers"), FilterSpec::new("cycle")];
        Self {
            job_store: store.clone(),
            job_retrieve: retrieve.clone(),
            store,
            retrieve,
        }
    }
}

impl SelectionConfig {
    pub fn specs(&self, kind: ChainKind) -> &[FilterSpec] {
        match kind {
            ChainKind::Store => &self.store,
            ChainKind::Retrieve => &self.retrieve,
            ChainKind::JobStore => &self.job_store,
            ChainKind::JobRetrieve => &self.job_retrieve,
        }
    }
}

/// An ordered, immutable list of filters.
pub struct FilterChain {
    specs: Vec<FilterSpec>,
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    /// Builds every filter up front; one bad entry fails the whole chain.
    pub fn build(
        specs: &[FilterSpec],
        registry: &FilterRegistry,
        env: &FilterEnv,
    ) -> Result<Self, ConfigError> {
        let filters = specs
            .iter()
            .map(|spec| registry.build(spec, env))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            specs: specs.to_vec(),
            filters,
        })
    }

    /// A chain of already-built filters, with no specs to report back.
    pub fn from_filters(filters: Vec<Box<dyn Filter>>) -> Self {
        Self {
            specs: Vec::new(),
            filters,
        }
    }

    pub fn specs(&self) -> &[FilterSpec] {
        &self.specs
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Runs the filters in order. Stops early once nothing is left.
    pub async fn run(&self, chart: &mut ScoreChart, ctx: &SelectionContext) {
        for filter in &self.filters {
            if chart.is_empty() {
                break;
            }
            filter.process(chart, ctx).await;
            debug!("After {}: {} candidates", filter.name(), chart.len());
        }
    }
}

pub struct SelectionManager {
    registry: FilterRegistry,
    env: FilterEnv,
    chains: RwLock<HashMap<ChainKind, Arc<FilterChain>>>,
}

impl SelectionManager {
    pub fn new(
        registry: FilterRegistry,
        env: FilterEnv,
        config: &SelectionConfig,
    ) -> Result<Self, ConfigError> {
        let mut chains = HashMap::new();
        for kind in ChainKind::ALL {
            let chain = FilterChain::build(config.specs(kind), &registry, &env)?;
            chains.insert(kind, Arc::new(chain));
        }
        Ok(Self {
            registry,
            env,
            chains: RwLock::new(chains),
        })
    }

    pub fn chain(&self, kind: ChainKind) -> Option<Arc<FilterChain>> {
        self.chains.read().get(&kind).cloned()
    }

    /// Replaces one chain. Decisions already running keep the old one.
    pub fn set_chain(&self, kind: ChainKind, specs: &[FilterSpec]) -> Result<(), ConfigError> {
        let chain = Arc::new(FilterChain::build(specs, &self.registry, &self.env)?);
        info!("Selection chain {} set to {:?}", kind, chain.filter_names());
        self.chains.write().insert(kind, chain);
        Ok(())
    }

    pub fn config(&self) -> SelectionConfig {
        let specs = |kind| {
            self.chain(kind)
                .map(|chain| chain.specs().to_vec())
                .unwrap_or_default()
        };
        SelectionConfig {
            store: specs(ChainKind::Store),
            retrieve: specs(ChainKind::Retrieve),
            job_store: specs(ChainKind::JobStore),
            job_retrieve: specs(ChainKind::JobRetrieve),
        }
    }

    /// Ranks the available peers among `pool`, best first.
    pub async fn select(
        &self,
        kind: ChainKind,
        pool: Vec<Arc<RemotePeer>>,
        ctx: &SelectionContext,
    ) -> Result<Vec<ScoredPeer>, SelectionError> {
        let candidates: Vec<_> = pool.into_iter().filter(|p| p.is_available()).collect();
        if candidates.is_empty() {
            warn!("No {} candidates for {}: no peers online", kind, ctx.path);
            return Err(SelectionError::NoAvailablePeer {
                reason: NoPeerReason::NoPeersOnline,
            });
        }

        let mut chart = ScoreChart::new(candidates);
        if kind.is_job() {
            chart.retain("excluded from replication", |entry| {
                !ctx.exclude.contains(entry.name())
                    && ctx.source_peer.as_ref() != Some(entry.name())
            });
        }

        if let Some(chain) = self.chain(kind) {
            chain.run(&mut chart, ctx).await;
        }

        if chart.is_empty() {
            warn!("No {} candidates for {}: all eliminated", kind, ctx.path);
            return Err(SelectionError::NoAvailablePeer {
                reason: NoPeerReason::AllEliminated,
            });
        }

        let ranked = chart.ranked();
        debug!(
            "Selected {} for {} {} (score {})",
            ranked[0].name(),
            kind,
            ctx.path,
            ranked[0].score
        );
        Ok(ranked)
    }
}

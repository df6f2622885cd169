//! Filter trait and the name → constructor registry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::chart::ScoreChart;
use super::filters;
use super::types::{FilterSpec, SelectionContext};
use crate::error::ConfigError;
use crate::protocol::central::ProtocolCentral;

/// One step of a filter chain. A filter only ever sees the candidates that
/// survived the filters before it.
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, chart: &mut ScoreChart, ctx: &SelectionContext);
}

/// What filter constructors may capture besides their own parameters.
#[derive(Clone)]
pub struct FilterEnv {
    pub central: Arc<ProtocolCentral>,
}

pub type FilterConstructor = fn(&FilterSpec, &FilterEnv) -> Result<Box<dyn Filter>, ConfigError>;

pub struct FilterRegistry {
    constructors: HashMap<String, FilterConstructor>,
}

impl FilterRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry holding every built-in filter.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("minfreespace", filters::MinFreeSpace::build);
        registry.register("maxtransfers", filters::MaxTransfers::build);
        registry.register("matchdir", filters::MatchDir::build);
        registry.register("transfers", filters::Transfers::build);
        registry.register("cycle", filters::Cycle::build);
        registry.register("priority", filters::Priority::build);
        registry.register("ping", filters::Ping::build);
        registry.register("freespace", filters::FreeSpace::build);
        registry
    }

    pub fn register(&mut self, name: &str, constructor: FilterConstructor) {
        self.constructors
            .insert(name.to_ascii_lowercase(), constructor);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn build(
        &self,
        spec: &FilterSpec,
        env: &FilterEnv,
    ) -> Result<Box<dyn Filter>, ConfigError> {
        let constructor = self
            .constructors
            .get(&spec.filter.to_ascii_lowercase())
            .ok_or_else(|| ConfigError::UnknownFilter(spec.filter.clone()))?;
        constructor(spec, env)
    }
}

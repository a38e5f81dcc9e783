//! Server selection strategies
//!
//! A [`RoutingStrategy`] picks one server out of the healthy candidates for a
//! call. Strategies are stateful (round-robin counters, hash rings), so the
//! [`StrategyFactory`] caches one instance per name and parameter set.

mod consistent_hash;
mod random;
mod round_robin;
mod weighted;

pub use consistent_hash::ConsistentHashStrategy;
pub use random::RandomStrategy;
pub use round_robin::RoundRobinStrategy;
pub use weighted::WeightedStrategy;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::StrategiesConfig;
use crate::registry::ServerInstance;

/// Name of the strategy used when an unknown one is requested
pub const FALLBACK_STRATEGY: &str = "round_robin";

/// Picks a server for a call
pub trait RoutingStrategy: Send + Sync {
    /// Registered name
    fn name(&self) -> &'static str;

    /// Choose one of `candidates`; `None` only when there are none
    fn select<'a>(&self, candidates: &'a [ServerInstance], params: &Value)
    -> Option<&'a ServerInstance>;
}

type Constructor = fn(&StrategiesConfig) -> Arc<dyn RoutingStrategy>;

/// Builds and caches routing strategies by name
pub struct StrategyFactory {
    defaults: StrategiesConfig,
    constructors: HashMap<&'static str, Constructor>,
    cache: DashMap<String, Arc<dyn RoutingStrategy>>,
}

impl StrategyFactory {
    /// Factory with the built-in strategies, using `defaults` as parameters
    #[must_use]
    pub fn new(defaults: StrategiesConfig) -> Self {
        let mut constructors: HashMap<&'static str, Constructor> = HashMap::new();
        constructors.insert("round_robin", build_round_robin);
        constructors.insert("weighted", build_weighted);
        constructors.insert("consistent_hash", build_consistent_hash);
        constructors.insert("random", build_random);

        Self {
            defaults,
            constructors,
            cache: DashMap::new(),
        }
    }

    /// Registered strategy names, sorted
    pub fn available(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.constructors.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Strategy `name` with the factory's default parameters
    pub fn get(&self, name: &str) -> Arc<dyn RoutingStrategy> {
        self.get_with(name, &self.defaults)
    }

    /// Strategy `name` with explicit parameters
    ///
    /// The same name and parameters always return the same instance.
    /// Unknown names fall back to round robin.
    pub fn get_with(&self, name: &str, params: &StrategiesConfig) -> Arc<dyn RoutingStrategy> {
        let (name, constructor) = match self.constructors.get_key_value(name) {
            Some((name, constructor)) => (*name, *constructor),
            None => {
                warn!(strategy = %name, fallback = FALLBACK_STRATEGY, "Unknown routing strategy");
                match self.constructors.get_key_value(FALLBACK_STRATEGY) {
                    Some((name, constructor)) => (*name, *constructor),
                    None => return Arc::new(RoundRobinStrategy::new()),
                }
            }
        };

        let key = format!("{name}|{params:?}");
        Arc::clone(
            self.cache
                .entry(key)
                .or_insert_with(|| {
                    debug!(strategy = %name, "Created routing strategy");
                    constructor(params)
                })
                .value(),
        )
    }
}

fn build_round_robin(_: &StrategiesConfig) -> Arc<dyn RoutingStrategy> {
    Arc::new(RoundRobinStrategy::new())
}

fn build_weighted(config: &StrategiesConfig) -> Arc<dyn RoutingStrategy> {
    Arc::new(WeightedStrategy::new(config.weighted.default_weight))
}

fn build_consistent_hash(config: &StrategiesConfig) -> Arc<dyn RoutingStrategy> {
    Arc::new(ConsistentHashStrategy::new(
        config.consistent_hash.virtual_nodes,
        config.consistent_hash.hash_fields.clone(),
    ))
}

fn build_random(_: &StrategiesConfig) -> Arc<dyn RoutingStrategy> {
    Arc::new(RandomStrategy)
}

impl Default for StrategyFactory {
    fn default() -> Self {
        Self::new(StrategiesConfig::default())
    }
}

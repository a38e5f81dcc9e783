use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;

use super::RoutingStrategy;
use crate::registry::ServerInstance;

/// Cycles through candidates; one counter per distinct candidate set
#[derive(Default)]
pub struct RoundRobinStrategy {
    counters: DashMap<String, AtomicU64>,
}

impl RoundRobinStrategy {
    /// New strategy with no counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn set_key(candidates: &[ServerInstance]) -> String {
        let mut names: Vec<&str> = candidates.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.join(",")
    }
}

impl RoutingStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select<'a>(
        &self,
        candidates: &'a [ServerInstance],
        _params: &Value,
    ) -> Option<&'a ServerInstance> {
        if candidates.is_empty() {
            return None;
        }
        let turn = self
            .counters
            .entry(Self::set_key(candidates))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        // usize always fits in u64 on supported targets
        #[allow(clippy::cast_possible_truncation)]
        let index = (turn % candidates.len() as u64) as usize;
        candidates.get(index)
    }
}

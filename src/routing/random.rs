use serde_json::Value;

use super::RoutingStrategy;
use crate::registry::ServerInstance;

/// Uniform random choice
pub struct RandomStrategy;

impl RoutingStrategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select<'a>(
        &self,
        candidates: &'a [ServerInstance],
        _params: &Value,
    ) -> Option<&'a ServerInstance> {
        if candidates.is_empty() {
            return None;
        }
        candidates.get(rand::random_range(0..candidates.len()))
    }
}

use serde_json::Value;

use super::RoutingStrategy;
use crate::registry::ServerInstance;

/// Picks candidates with probability proportional to their weight
pub struct WeightedStrategy {
    default_weight: u32,
}

impl WeightedStrategy {
    /// `default_weight` replaces a declared weight of 0
    #[must_use]
    pub fn new(default_weight: u32) -> Self {
        Self { default_weight }
    }

    fn weight_of(&self, server: &ServerInstance) -> u64 {
        if server.weight == 0 {
            u64::from(self.default_weight)
        } else {
            u64::from(server.weight)
        }
    }
}

impl RoutingStrategy for WeightedStrategy {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select<'a>(
        &self,
        candidates: &'a [ServerInstance],
        _params: &Value,
    ) -> Option<&'a ServerInstance> {
        if candidates.len() <= 1 {
            return candidates.first();
        }

        let total: u64 = candidates.iter().map(|s| self.weight_of(s)).sum();
        if total == 0 {
            return candidates.get(rand::random_range(0..candidates.len()));
        }

        let draw = rand::random_range(0..total);
        let mut cumulative = 0;
        for server in candidates {
            cumulative += self.weight_of(server);
            if draw < cumulative {
                return Some(server);
            }
        }
        candidates.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distribution_follows_weights() {
        let strategy = WeightedStrategy::new(100);
        let candidates = vec![
            ServerInstance::new("heavy").with_weight(100),
            ServerInstance::new("light").with_weight(1),
        ];

        let heavy = (0..10_000)
            .filter_map(|_| strategy.select(&candidates, &Value::Null))
            .filter(|s| s.name == "heavy")
            .count();
        // expected 9901; bounds are > 6 standard deviations wide
        assert!((9_800..=9_990).contains(&heavy), "heavy picked {heavy} times");
    }

    #[test]
    fn test_zero_weight_uses_default() {
        let strategy = WeightedStrategy::new(100);
        let candidates = vec![
            ServerInstance::new("a").with_weight(0),
            ServerInstance::new("b").with_weight(100),
        ];
        let a = (0..2_000)
            .filter_map(|_| strategy.select(&candidates, &Value::Null))
            .filter(|s| s.name == "a")
            .count();
        assert!((800..=1_200).contains(&a), "a picked {a} times");
    }

    #[test]
    fn test_all_zero_is_uniform() {
        let strategy = WeightedStrategy::new(0);
        let candidates = vec![
            ServerInstance::new("a").with_weight(0),
            ServerInstance::new("b").with_weight(0),
        ];
        let a = (0..2_000)
            .filter_map(|_| strategy.select(&candidates, &Value::Null))
            .filter(|s| s.name == "a")
            .count();
        assert!((800..=1_200).contains(&a), "a picked {a} times");
    }
}

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::RoutingStrategy;
use crate::registry::ServerInstance;

/// Hash ring for one candidate set
struct Ring {
    /// Sorted candidate names the ring was built from
    signature: Vec<String>,
    /// (position, server name), sorted by position
    points: Vec<(u64, String)>,
}

impl Ring {
    fn build(signature: Vec<String>, virtual_nodes: usize) -> Self {
        let mut points: Vec<(u64, String)> = signature
            .iter()
            .flat_map(|name| {
                (0..virtual_nodes).map(move |i| (stable_hash(&format!("{name}:{i}")), name.clone()))
            })
            .collect();
        points.sort_unstable();
        Self { signature, points }
    }

    fn locate(&self, key_hash: u64) -> Option<&str> {
        let idx = self.points.partition_point(|(pos, _)| *pos < key_hash);
        self.points
            .get(idx)
            .or_else(|| self.points.first())
            .map(|(_, name)| name.as_str())
    }
}

/// Sends equal keys to the same server while the candidate set is stable
///
/// Adding one server to `K` remaps roughly `1/(K+1)` of the keys.
pub struct ConsistentHashStrategy {
    virtual_nodes: usize,
    hash_fields: Vec<String>,
    ring: RwLock<Option<Ring>>,
}

impl ConsistentHashStrategy {
    /// `virtual_nodes` ring points per server, key taken from `hash_fields`
    #[must_use]
    pub fn new(virtual_nodes: usize, hash_fields: Vec<String>) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            hash_fields,
            ring: RwLock::new(None),
        }
    }

    /// Routing key for `params`
    ///
    /// The first non-empty configured field wins; otherwise the whole
    /// object is hashed. Null or empty params get a random key.
    fn hash_key(&self, params: &Value) -> String {
        match params {
            Value::Object(map) if !map.is_empty() => {
                for field in &self.hash_fields {
                    match map.get(field) {
                        Some(Value::String(s)) if !s.is_empty() => return s.clone(),
                        Some(Value::Null | Value::String(_)) | None => {}
                        Some(other) => return other.to_string(),
                    }
                }
                let sorted: BTreeMap<&String, &Value> = map.iter().collect();
                serde_json::to_string(&sorted).unwrap_or_else(|_| params.to_string())
            }
            Value::Null | Value::Object(_) => rand::random::<u64>().to_string(),
            Value::String(s) if s.is_empty() => rand::random::<u64>().to_string(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn server_for(&self, candidates: &[ServerInstance], key_hash: u64) -> Option<String> {
        let mut signature: Vec<String> = candidates.iter().map(|s| s.name.clone()).collect();
        signature.sort_unstable();

        {
            let ring = self.ring.read();
            if let Some(ring) = ring.as_ref().filter(|r| r.signature == signature) {
                return ring.locate(key_hash).map(str::to_string);
            }
        }

        let mut ring = self.ring.write();
        if ring.as_ref().is_none_or(|r| r.signature != signature) {
            *ring = Some(Ring::build(signature, self.virtual_nodes));
        }
        ring.as_ref()
            .and_then(|r| r.locate(key_hash))
            .map(str::to_string)
    }
}

impl RoutingStrategy for ConsistentHashStrategy {
    fn name(&self) -> &'static str {
        "consistent_hash"
    }

    fn select<'a>(
        &self,
        candidates: &'a [ServerInstance],
        params: &Value,
    ) -> Option<&'a ServerInstance> {
        if candidates.len() <= 1 {
            return candidates.first();
        }
        let key_hash = stable_hash(&self.hash_key(params));
        let name = self.server_for(candidates, key_hash)?;
        candidates.iter().find(|s| s.name == name)
    }
}

/// First 8 bytes of SHA-256, big-endian
fn stable_hash(input: &str) -> u64 {
    Sha256::digest(input.as_bytes())
        .iter()
        .take(8)
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

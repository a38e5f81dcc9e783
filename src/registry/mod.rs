//! Server registry
//!
//! Directory of backend server instances with a hysteresis health state
//! machine, per-server request statistics and a physical tool → servers
//! index. Servers and the index live behind one lock so they never disagree.

mod checker;
mod instance;

pub use checker::{Clock, HeartbeatChecker};
pub use instance::{ServerInstance, ServerRegistration, ServerStats, ServerStatus, ServerSummary};

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{HealthCheckConfig, HeartbeatConfig, RegistryConfig};

/// Filter for [`ServerRegistry::list_servers`]
#[derive(Debug, Clone, Default)]
pub struct ServerFilter {
    /// Only this environment
    pub environment: Option<String>,
    /// Only this status
    pub status: Option<ServerStatus>,
}

/// Transitions applied by one heartbeat sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Healthy servers demoted for a late heartbeat
    pub unhealthy: Vec<String>,
    /// Servers silent past the offline threshold
    pub offline: Vec<String>,
    /// Offline servers removed
    pub evicted: Vec<String>,
}

impl SweepReport {
    /// Whether the sweep changed nothing
    pub fn is_empty(&self) -> bool {
        self.unhealthy.is_empty() && self.offline.is_empty() && self.evicted.is_empty()
    }
}

#[derive(Default)]
struct RegistryState {
    servers: HashMap<String, ServerInstance>,
    /// Names in registration order
    order: Vec<String>,
    /// Physical tool → server names, in registration order
    tool_index: HashMap<String, Vec<String>>,
}

impl RegistryState {
    fn reindex(&mut self, name: &str) {
        self.unindex(name);
        let Some(server) = self.servers.get(name) else {
            return;
        };
        for tool in &server.tools {
            let owners = self.tool_index.entry(tool.clone()).or_default();
            if !owners.iter().any(|n| n == name) {
                owners.push(name.to_string());
            }
        }
    }

    fn unindex(&mut self, name: &str) {
        self.tool_index.retain(|_, owners| {
            owners.retain(|n| n != name);
            !owners.is_empty()
        });
    }

    fn remove(&mut self, name: &str) -> Option<ServerInstance> {
        let server = self.servers.remove(name)?;
        self.order.retain(|n| n != name);
        self.unindex(name);
        Some(server)
    }

    fn ordered(&self) -> impl Iterator<Item = &ServerInstance> {
        self.order.iter().filter_map(|n| self.servers.get(n))
    }
}

/// Live directory of backend servers
pub struct ServerRegistry {
    thresholds: HealthCheckConfig,
    state: RwLock<RegistryState>,
}

impl ServerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(thresholds: HealthCheckConfig) -> Self {
        Self {
            thresholds,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Create a registry seeded with the configured static servers
    ///
    /// Seeds start `Unknown` and have no heartbeat.
    #[must_use]
    pub fn from_config(config: &RegistryConfig) -> Self {
        let registry = Self::new(config.health_check);
        {
            let mut state = registry.state.write();
            for seed in &config.static_servers {
                let mut server = ServerInstance::new(&seed.name);
                server.description.clone_from(&seed.description);
                server.environment.clone_from(&seed.environment);
                server.weight = seed.weight;
                server.tools.clone_from(&seed.tools);

                if state.servers.insert(seed.name.clone(), server).is_none() {
                    state.order.push(seed.name.clone());
                }
                state.reindex(&seed.name);
                debug!(server = %seed.name, "Loaded static server");
            }
        }
        info!(servers = config.static_servers.len(), "Server registry initialized");
        registry
    }

    /// Register a new server or refresh an existing one
    ///
    /// Either way the server ends `Healthy` with a fresh heartbeat and
    /// cleared failure and success streaks.
    pub fn register(&self, registration: ServerRegistration) -> ServerInstance {
        let now = Utc::now();
        let mut state = self.state.write();
        let name = registration.name.clone();

        if let Some(server) = state.servers.get_mut(&name) {
            server.description = registration.description;
            server.environment = registration.environment;
            server.weight = registration.weight;
            server.status = ServerStatus::Healthy;
            server.last_heartbeat = Some(now);
            server.consecutive_failures = 0;
            server.consecutive_successes = 0;
            if !registration.tools.is_empty() {
                server.tools = registration.tools;
            }
            info!(server = %name, "Server registration updated");
        } else {
            let mut server = ServerInstance::new(&name);
            server.description = registration.description;
            server.environment = registration.environment;
            server.weight = registration.weight;
            server.status = ServerStatus::Healthy;
            server.last_heartbeat = Some(now);
            server.registered_at = now;
            server.tools = registration.tools;
            state.servers.insert(name.clone(), server);
            state.order.push(name.clone());
            info!(server = %name, "Server registered");
        }

        state.reindex(&name);
        state.servers.get(&name).cloned().unwrap_or_else(|| ServerInstance::new(&name))
    }

    /// Record a heartbeat; `false` for unknown servers
    pub fn heartbeat(&self, name: &str) -> bool {
        let mut state = self.state.write();
        let Some(server) = state.servers.get_mut(name) else {
            warn!(server = %name, "Heartbeat from unknown server");
            return false;
        };
        server.last_heartbeat = Some(Utc::now());
        server.status = ServerStatus::Healthy;
        server.consecutive_failures = 0;
        server.consecutive_successes += 1;
        debug!(server = %name, "Heartbeat received");
        true
    }

    /// Remove a server and purge it from the tool index
    pub fn deregister(&self, name: &str) -> bool {
        let removed = self.state.write().remove(name).is_some();
        if removed {
            info!(server = %name, "Server deregistered");
        }
        removed
    }

    /// Count a failure; flips to `Unhealthy` at the configured threshold
    pub fn mark_unhealthy(&self, name: &str) {
        let mut state = self.state.write();
        let Some(server) = state.servers.get_mut(name) else {
            return;
        };
        server.consecutive_failures += 1;
        server.consecutive_successes = 0;

        // only a heartbeat or a registration brings an offline server back
        if server.consecutive_failures >= self.thresholds.unhealthy_threshold
            && matches!(server.status, ServerStatus::Healthy | ServerStatus::Unknown)
        {
            server.status = ServerStatus::Unhealthy;
            warn!(
                server = %name,
                consecutive_failures = server.consecutive_failures,
                "Server marked unhealthy"
            );
        }
    }

    /// Count a success; flips to `Healthy` at the configured threshold
    pub fn mark_healthy(&self, name: &str) {
        let mut state = self.state.write();
        let Some(server) = state.servers.get_mut(name) else {
            return;
        };
        server.consecutive_successes += 1;
        server.consecutive_failures = 0;

        if server.consecutive_successes >= self.thresholds.healthy_threshold
            && matches!(server.status, ServerStatus::Unhealthy | ServerStatus::Unknown)
        {
            server.status = ServerStatus::Healthy;
            info!(server = %name, "Server recovered");
        }
    }

    /// Update request statistics
    pub fn record_request(&self, name: &str, success: bool) {
        let mut state = self.state.write();
        if let Some(server) = state.servers.get_mut(name) {
            server.total_requests += 1;
            if !success {
                server.failed_requests += 1;
            }
        }
    }

    /// Snapshot of one server
    pub fn get_server(&self, name: &str) -> Option<ServerInstance> {
        self.state.read().servers.get(name).cloned()
    }

    /// Healthy servers providing `tool`, in registration order
    pub fn get_servers_for_tool(&self, tool: &str) -> Vec<ServerInstance> {
        let state = self.state.read();
        state
            .tool_index
            .get(tool)
            .into_iter()
            .flatten()
            .filter_map(|name| state.servers.get(name))
            .filter(|s| s.is_healthy())
            .cloned()
            .collect()
    }

    /// Healthy servers, optionally restricted to one environment
    pub fn get_healthy_servers(&self, environment: Option<&str>) -> Vec<ServerInstance> {
        let state = self.state.read();
        state
            .ordered()
            .filter(|s| s.is_healthy())
            .filter(|s| environment.is_none_or(|env| s.environment == env))
            .cloned()
            .collect()
    }

    /// Summaries of all servers matching `filter`, in registration order
    pub fn list_servers(&self, filter: &ServerFilter) -> Vec<ServerSummary> {
        let state = self.state.read();
        state
            .ordered()
            .filter(|s| {
                filter
                    .environment
                    .as_deref()
                    .is_none_or(|env| s.environment == env)
            })
            .filter(|s| filter.status.is_none_or(|st| s.status == st))
            .map(ServerInstance::summary)
            .collect()
    }

    /// Number of registered servers
    pub fn len(&self) -> usize {
        self.state.read().servers.len()
    }

    /// Whether no server is registered
    pub fn is_empty(&self) -> bool {
        self.state.read().servers.is_empty()
    }

    /// Apply heartbeat timeouts as of `now`
    ///
    /// Servers silent longer than `offline_threshold` go `Offline` whatever
    /// their status; healthy servers silent longer than `timeout` go
    /// `Unhealthy`. Servers that never sent a heartbeat are skipped. With
    /// `evict_after` set, offline servers silent that long are removed.
    pub fn sweep(&self, now: DateTime<Utc>, policy: &HeartbeatConfig) -> SweepReport {
        let mut report = SweepReport::default();
        let mut state = self.state.write();

        for name in state.order.clone() {
            let Some(server) = state.servers.get_mut(&name) else {
                continue;
            };
            let Some(last) = server.last_heartbeat else {
                continue;
            };
            let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);

            if elapsed > policy.offline_threshold {
                if server.status != ServerStatus::Offline {
                    server.status = ServerStatus::Offline;
                    warn!(server = %name, elapsed_secs = elapsed.as_secs(), "Server offline");
                    report.offline.push(name.clone());
                }
                if policy.evict_after.is_some_and(|limit| elapsed > limit) {
                    state.remove(&name);
                    info!(server = %name, elapsed_secs = elapsed.as_secs(), "Offline server evicted");
                    report.evicted.push(name);
                }
            } else if elapsed > policy.timeout && server.status == ServerStatus::Healthy {
                server.status = ServerStatus::Unhealthy;
                warn!(server = %name, elapsed_secs = elapsed.as_secs(), "Server heartbeat timed out");
                report.unhealthy.push(name);
            }
        }

        report
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new(HealthCheckConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticServerConfig;

    fn tools(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn names(servers: &[ServerInstance]) -> Vec<&str> {
        servers.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_register_indexes_tools_in_order() {
        let registry = ServerRegistry::default();
        registry.register(ServerRegistration::new("s1", tools(&["x", "y"])));
        registry.register(ServerRegistration::new("s2", tools(&["x"])));

        assert_eq!(names(&registry.get_servers_for_tool("x")), vec!["s1", "s2"]);
        assert_eq!(names(&registry.get_servers_for_tool("y")), vec!["s1"]);
        assert!(registry.get_servers_for_tool("z").is_empty());
    }

    #[test]
    fn test_reregister_replaces_tools_and_resets_health() {
        let registry = ServerRegistry::default();
        registry.register(ServerRegistration::new("s1", tools(&["x"])));
        for _ in 0..3 {
            registry.mark_unhealthy("s1");
        }
        assert_eq!(registry.get_server("s1").unwrap().status, ServerStatus::Unhealthy);

        let server = registry.register(ServerRegistration::new("s1", tools(&["y"])).with_weight(7));
        assert_eq!(server.status, ServerStatus::Healthy);
        assert_eq!(server.weight, 7);
        assert!(registry.get_servers_for_tool("x").is_empty());
        assert_eq!(names(&registry.get_servers_for_tool("y")), vec!["s1"]);

        assert_eq!(server.consecutive_failures, 0);

        // the old failure streak does not carry over
        registry.mark_unhealthy("s1");
        let server = registry.get_server("s1").unwrap();
        assert_eq!(server.status, ServerStatus::Healthy);
        assert_eq!(server.consecutive_failures, 1);

        // an empty list keeps the current tools
        registry.register(ServerRegistration::new("s1", Vec::new()));
        assert_eq!(names(&registry.get_servers_for_tool("y")), vec!["s1"]);
    }

    #[test]
    fn test_unhealthy_needs_threshold_failures() {
        let registry = ServerRegistry::default();
        registry.register(ServerRegistration::new("s1", tools(&["x"])));

        registry.mark_unhealthy("s1");
        registry.mark_unhealthy("s1");
        assert_eq!(registry.get_server("s1").unwrap().status, ServerStatus::Healthy);

        registry.mark_unhealthy("s1");
        assert_eq!(registry.get_server("s1").unwrap().status, ServerStatus::Unhealthy);
        // index membership survives, selection does not
        assert!(registry.get_servers_for_tool("x").is_empty());
    }

    #[test]
    fn test_recovery_needs_threshold_successes() {
        let registry = ServerRegistry::default();
        registry.register(ServerRegistration::new("s1", tools(&["x"])));
        for _ in 0..3 {
            registry.mark_unhealthy("s1");
        }

        registry.mark_healthy("s1");
        assert_eq!(registry.get_server("s1").unwrap().status, ServerStatus::Unhealthy);
        registry.mark_healthy("s1");
        assert_eq!(registry.get_server("s1").unwrap().status, ServerStatus::Healthy);
        assert_eq!(names(&registry.get_servers_for_tool("x")), vec!["s1"]);
    }

    #[test]
    fn test_interleaved_outcomes_reset_streaks() {
        let registry = ServerRegistry::default();
        registry.register(ServerRegistration::new("s1", Vec::new()));

        registry.mark_unhealthy("s1");
        registry.mark_unhealthy("s1");
        registry.mark_healthy("s1");
        registry.mark_unhealthy("s1");
        registry.mark_unhealthy("s1");

        let server = registry.get_server("s1").unwrap();
        assert_eq!(server.status, ServerStatus::Healthy);
        assert_eq!(server.consecutive_failures, 2);
    }

    #[test]
    fn test_heartbeat() {
        let registry = ServerRegistry::default();
        assert!(!registry.heartbeat("ghost"));

        registry.register(ServerRegistration::new("s1", Vec::new()));
        for _ in 0..3 {
            registry.mark_unhealthy("s1");
        }
        assert!(registry.heartbeat("s1"));

        let server = registry.get_server("s1").unwrap();
        assert_eq!(server.status, ServerStatus::Healthy);
        assert_eq!(server.consecutive_failures, 0);
        assert_eq!(server.consecutive_successes, 1);
    }

    #[test]
    fn test_deregister_purges_index() {
        let registry = ServerRegistry::default();
        registry.register(ServerRegistration::new("s1", tools(&["x"])));
        registry.register(ServerRegistration::new("s2", tools(&["x"])));

        assert!(registry.deregister("s1"));
        assert!(!registry.deregister("s1"));
        assert_eq!(names(&registry.get_servers_for_tool("x")), vec!["s2"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_record_request_statistics() {
        let registry = ServerRegistry::default();
        registry.register(ServerRegistration::new("s1", Vec::new()));
        registry.record_request("s1", true);
        registry.record_request("s1", false);
        registry.record_request("ghost", true);

        let summary = registry.get_server("s1").unwrap().summary();
        assert_eq!(summary.stats.total_requests, 2);
        assert_eq!(summary.stats.failed_requests, 1);
        assert!((summary.stats.success_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_static_seeds_start_unknown() {
        let config = RegistryConfig {
            static_servers: vec![StaticServerConfig {
                name: "seed".to_string(),
                description: String::new(),
                environment: "staging".to_string(),
                weight: 100,
                tools: tools(&["x"]),
            }],
            ..RegistryConfig::default()
        };
        let registry = ServerRegistry::from_config(&config);

        let seed = registry.get_server("seed").unwrap();
        assert_eq!(seed.status, ServerStatus::Unknown);
        assert!(seed.last_heartbeat.is_none());
        assert!(registry.get_servers_for_tool("x").is_empty());

        registry.mark_healthy("seed");
        registry.mark_healthy("seed");
        assert_eq!(names(&registry.get_servers_for_tool("x")), vec!["seed"]);
    }

    #[test]
    fn test_list_servers_filters() {
        let registry = ServerRegistry::default();
        registry.register(ServerRegistration::new("a", Vec::new()).in_environment("prod"));
        registry.register(ServerRegistration::new("b", Vec::new()));
        registry.register(ServerRegistration::new("c", Vec::new()).in_environment("prod"));
        for _ in 0..3 {
            registry.mark_unhealthy("c");
        }

        let prod = registry.list_servers(&ServerFilter {
            environment: Some("prod".to_string()),
            status: None,
        });
        assert_eq!(prod.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["a", "c"]);

        let healthy_prod = registry.list_servers(&ServerFilter {
            environment: Some("prod".to_string()),
            status: Some(ServerStatus::Healthy),
        });
        assert_eq!(healthy_prod.len(), 1);
        assert_eq!(registry.get_healthy_servers(None).len(), 2);
        assert_eq!(names(&registry.get_healthy_servers(Some("default"))), vec!["b"]);
    }

    #[test]
    fn test_sweep_demotes_by_elapsed_time() {
        let registry = ServerRegistry::default();
        registry.register(ServerRegistration::new("s1", tools(&["x"])));
        let policy = HeartbeatConfig::default();
        let now = Utc::now();

        assert!(registry.sweep(now, &policy).is_empty());

        let report = registry.sweep(now + chrono::Duration::seconds(100), &policy);
        assert_eq!(report.unhealthy, vec!["s1".to_string()]);
        assert_eq!(registry.get_server("s1").unwrap().status, ServerStatus::Unhealthy);

        let report = registry.sweep(now + chrono::Duration::seconds(200), &policy);
        assert_eq!(report.offline, vec!["s1".to_string()]);
        assert_eq!(registry.get_server("s1").unwrap().status, ServerStatus::Offline);

        // retained by default
        assert!(registry.sweep(now + chrono::Duration::days(1), &policy).is_empty());
        assert!(registry.get_server("s1").is_some());
    }

    #[test]
    fn test_offline_waits_for_heartbeat() {
        let registry = ServerRegistry::default();
        registry.register(ServerRegistration::new("s1", tools(&["x"])));
        let later = Utc::now() + chrono::Duration::seconds(200);
        registry.sweep(later, &HeartbeatConfig::default());
        assert_eq!(registry.get_server("s1").unwrap().status, ServerStatus::Offline);

        for _ in 0..3 {
            registry.mark_unhealthy("s1");
        }
        assert_eq!(registry.get_server("s1").unwrap().status, ServerStatus::Offline);
        for _ in 0..2 {
            registry.mark_healthy("s1");
        }
        assert_eq!(registry.get_server("s1").unwrap().status, ServerStatus::Offline);
        assert!(registry.get_servers_for_tool("x").is_empty());

        assert!(registry.heartbeat("s1"));
        assert_eq!(registry.get_server("s1").unwrap().status, ServerStatus::Healthy);
    }

    #[test]
    fn test_sweep_skips_servers_without_heartbeat() {
        let config = RegistryConfig {
            static_servers: vec![StaticServerConfig {
                name: "seed".to_string(),
                description: String::new(),
                environment: "default".to_string(),
                weight: 100,
                tools: Vec::new(),
            }],
            ..RegistryConfig::default()
        };
        let registry = ServerRegistry::from_config(&config);
        let later = Utc::now() + chrono::Duration::hours(1);
        assert!(registry.sweep(later, &HeartbeatConfig::default()).is_empty());
        assert_eq!(registry.get_server("seed").unwrap().status, ServerStatus::Unknown);
    }

    #[test]
    fn test_sweep_evicts_when_configured() {
        let registry = ServerRegistry::default();
        registry.register(ServerRegistration::new("s1", tools(&["x"])));
        let policy = HeartbeatConfig {
            evict_after: Some(Duration::from_secs(600)),
            ..HeartbeatConfig::default()
        };
        let now = Utc::now();

        let report = registry.sweep(now + chrono::Duration::seconds(300), &policy);
        assert_eq!(report.offline, vec!["s1".to_string()]);
        assert!(report.evicted.is_empty());

        let report = registry.sweep(now + chrono::Duration::seconds(700), &policy);
        assert_eq!(report.evicted, vec!["s1".to_string()]);
        assert!(registry.get_server("s1").is_none());
        assert!(registry.is_empty());
    }
}

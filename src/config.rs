//! Configuration management

use std::{collections::HashMap, env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Registry HTTP surface
    pub server: ServerConfig,
    /// Tool catalog source
    pub catalog: CatalogConfig,
    /// Server registry, health and routing
    pub registry: RegistryConfig,
    /// Audit trail
    pub audit: AuditConfig,
    /// Call pipeline settings
    pub gateway: GatewaySettings,
    /// Retry policy for backend calls
    pub retry: RetryConfig,
    /// Backend MCP servers, keyed by server name
    pub backends: HashMap<String, BackendConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // TOOL_GATEWAY_REGISTRY__ROUTING__DEFAULT_STRATEGY=weighted
        figment = figment.merge(Env::prefixed("TOOL_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Reject values the services cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        let health = &self.registry.health_check;
        if health.healthy_threshold == 0 || health.unhealthy_threshold == 0 {
            return Err(Error::Config(
                "health_check thresholds must be at least 1".to_string(),
            ));
        }

        let heartbeat = &self.registry.heartbeat;
        if heartbeat.offline_threshold < heartbeat.timeout {
            return Err(Error::Config(format!(
                "heartbeat.offline_threshold ({}s) must not be shorter than heartbeat.timeout ({}s)",
                heartbeat.offline_threshold.as_secs(),
                heartbeat.timeout.as_secs()
            )));
        }
        if heartbeat.probe_interval.is_zero() {
            return Err(Error::Config(
                "heartbeat.probe_interval must be positive".to_string(),
            ));
        }

        for server in &self.registry.static_servers {
            if server.name.trim().is_empty() {
                return Err(Error::Config("static server without a name".to_string()));
            }
        }

        if self.registry.routing.strategies.consistent_hash.virtual_nodes == 0 {
            return Err(Error::Config(
                "consistent_hash.virtual_nodes must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in backend settings
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for backend in self.backends.values_mut() {
            for value in backend.headers.values_mut() {
                *value = Self::expand_string(&re, value);
            }
            for value in backend.env.values_mut() {
                *value = Self::expand_string(&re, value);
            }
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Get enabled backends only
    pub fn enabled_backends(&self) -> impl Iterator<Item = (&String, &BackendConfig)> {
        self.backends.iter().filter(|(_, b)| b.enabled)
    }
}

/// Registry HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39410,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Tool catalog source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Path to the catalog document (YAML)
    pub path: PathBuf,
    /// Reload the catalog when the file changes
    pub watch: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("config/tool_catalog.yaml"),
            watch: true,
        }
    }
}

/// Server registry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Servers known before any registration call
    pub static_servers: Vec<StaticServerConfig>,
    /// Health state machine thresholds
    pub health_check: HealthCheckConfig,
    /// Heartbeat checker timing
    pub heartbeat: HeartbeatConfig,
    /// Routing strategy selection
    pub routing: RoutingConfig,
}

/// A statically configured server instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticServerConfig {
    /// Unique server name
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Environment tag
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Load-balancing weight
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Physical tools served
    #[serde(default)]
    pub tools: Vec<String>,
}

fn default_environment() -> String {
    gateway_core::DEFAULT_ENVIRONMENT.to_string()
}

fn default_weight() -> u32 {
    100
}

/// Health state machine thresholds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Consecutive successes needed to flip back to healthy
    pub healthy_threshold: u32,
    /// Consecutive failures needed to flip to unhealthy
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

/// Heartbeat checker configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Run the background checker
    pub enabled: bool,
    /// How often the checker sweeps the registry
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    /// Silence after which a healthy server becomes unhealthy
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Silence after which any server becomes offline
    #[serde(with = "humantime_serde")]
    pub offline_threshold: Duration,
    /// Silence after which an offline server is removed; unset keeps it
    #[serde(with = "humantime_serde::option")]
    pub evict_after: Option<Duration>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(90),
            offline_threshold: Duration::from_secs(180),
            evict_after: None,
        }
    }
}

/// Routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Strategy used by `call_tool`
    pub default_strategy: String,
    /// Per-strategy parameters
    pub strategies: StrategiesConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: "round_robin".to_string(),
            strategies: StrategiesConfig::default(),
        }
    }
}

/// Per-strategy parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategiesConfig {
    /// Weighted random parameters
    pub weighted: WeightedConfig,
    /// Consistent hash parameters
    pub consistent_hash: ConsistentHashConfig,
}

/// Weighted random parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightedConfig {
    /// Weight used for servers that declare 0
    pub default_weight: u32,
}

impl Default for WeightedConfig {
    fn default() -> Self {
        Self {
            default_weight: 100,
        }
    }
}

/// Consistent hash parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistentHashConfig {
    /// Ring points per server
    pub virtual_nodes: usize,
    /// Parameter fields tried, in order, for the hash key
    pub hash_fields: Vec<String>,
}

impl Default for ConsistentHashConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: 150,
            hash_fields: vec![
                "target".to_string(),
                "query".to_string(),
                "domain".to_string(),
            ],
        }
    }
}

/// Audit trail configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Directory holding `audit_YYYY-MM-DD.jsonl` segments
    pub directory: PathBuf,
    /// Characters of the result payload kept in `result_summary`
    pub max_result_length: usize,
    /// Default cap on query results
    pub query_limit: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/logs/audit"),
            max_result_length: 500,
            query_limit: 100,
        }
    }
}

/// Call pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Environment used when the caller does not name one
    pub default_environment: String,
    /// Deadline for one `call_tool`, retries included
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            default_environment: default_environment(),
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts, first call included
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Human-readable description
    pub description: String,
    /// Whether backend is enabled
    pub enabled: bool,
    /// Transport type
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Per-request timeout for this backend
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum concurrent in-flight requests
    pub max_concurrency: usize,
    /// Environment variables (for stdio)
    pub env: HashMap<String, String>,
    /// HTTP headers (for http)
    pub headers: HashMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            description: String::new(),
            enabled: true,
            transport: TransportConfig::default(),
            timeout: Duration::from_secs(30),
            max_concurrency: 100,
            env: HashMap::new(),
            headers: HashMap::new(),
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportConfig {
    /// Stdio transport (subprocess)
    Stdio {
        /// Command to execute
        command: String,
        /// Working directory
        #[serde(default)]
        cwd: Option<String>,
    },
    /// HTTP transport (JSON-RPC over POST)
    Http {
        /// HTTP URL
        http_url: String,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Http {
            http_url: String::new(),
        }
    }
}

impl TransportConfig {
    /// Get transport type name
    #[must_use]
    pub fn transport_type(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
        }
    }
}

/// Duration (de)serialization as "30s", "5m", "100ms"
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn format_duration(duration: Duration) -> String {
        if duration.subsec_millis() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        }
    }

    /// Parse "30s", "5m", "100ms", "1h" or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns a message for malformed input or values that overflow.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" must be checked before "s" and "m"
        let (digits, unit_secs) = if let Some(ms) = s.strip_suffix("ms") {
            let ms = ms.parse::<u64>().map_err(|e| format!("invalid duration '{s}': {e}"))?;
            return Ok(Duration::from_millis(ms));
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600)
        } else {
            (s, 1)
        };
        let count = digits
            .parse::<u64>()
            .map_err(|e| format!("invalid duration '{s}': {e}"))?;
        count
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is too large"))
    }

    /// Same format for `Option<Duration>`; absent or null means `None`
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed as a duration.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

//! Server instance records

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Health of a server instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Known from configuration, never confirmed
    Unknown,
    /// Eligible for routing
    Healthy,
    /// Failed repeatedly or missed heartbeats
    Unhealthy,
    /// Silent past the offline threshold
    Offline,
}

impl ServerStatus {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(Self::Unknown),
            "healthy" => Ok(Self::Healthy),
            "unhealthy" => Ok(Self::Unhealthy),
            "offline" => Ok(Self::Offline),
            other => Err(Error::Config(format!("Unknown server status: {other}"))),
        }
    }
}

/// A backend server known to the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInstance {
    /// Unique name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Environment tag
    pub environment: String,
    /// Load-balancing weight; 0 means "use the strategy default"
    pub weight: u32,
    /// Current health
    pub status: ServerStatus,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Successes since the last failure
    pub consecutive_successes: u32,
    /// Requests routed here
    pub total_requests: u64,
    /// Requests that failed
    pub failed_requests: u64,
    /// Last heartbeat or registration
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// First time the registry saw this server
    pub registered_at: DateTime<Utc>,
    /// Physical tools served
    pub tools: Vec<String>,
}

impl ServerInstance {
    /// A fresh instance in `Unknown` state, weight 100, default environment
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            environment: gateway_core::DEFAULT_ENVIRONMENT.to_string(),
            weight: 100,
            status: ServerStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_requests: 0,
            failed_requests: 0,
            last_heartbeat: None,
            registered_at: Utc::now(),
            tools: Vec::new(),
        }
    }

    /// Set the weight
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the status
    #[must_use]
    pub fn with_status(mut self, status: ServerStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether the instance can take traffic
    pub fn is_healthy(&self) -> bool {
        self.status == ServerStatus::Healthy
    }

    /// Success percentage, 100.0 before any request
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            100.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let failed = self.failed_requests as f64 / self.total_requests as f64;
            (1.0 - failed) * 100.0
        }
    }

    /// Public view of the instance
    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            environment: self.environment.clone(),
            weight: self.weight,
            status: self.status,
            last_heartbeat: self.last_heartbeat,
            registered_at: self.registered_at,
            tools: self.tools.clone(),
            stats: ServerStats {
                total_requests: self.total_requests,
                failed_requests: self.failed_requests,
                success_rate: self.success_rate(),
            },
        }
    }
}

/// A registration (or re-registration) request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRegistration {
    /// Unique name
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
    /// Physical tools served; empty keeps the current list on re-registration
    #[serde(default)]
    pub tools: Vec<String>,
}

fn default_environment() -> String {
    gateway_core::DEFAULT_ENVIRONMENT.to_string()
}

fn default_weight() -> u32 {
    100
}

impl ServerRegistration {
    /// Registration with default metadata
    pub fn new(name: impl Into<String>, tools: Vec<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            environment: default_environment(),
            weight: default_weight(),
            tools,
        }
    }

    /// Set the environment
    #[must_use]
    pub fn in_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Set the weight
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Request statistics of a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStats {
    /// Requests routed here
    pub total_requests: u64,
    /// Requests that failed
    pub failed_requests: u64,
    /// Success percentage
    pub success_rate: f64,
}

/// Serializable view of a server instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSummary {
    /// Unique name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Environment tag
    pub environment: String,
    /// Load-balancing weight
    pub weight: u32,
    /// Current health
    pub status: ServerStatus,
    /// Last heartbeat
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// First registration
    pub registered_at: DateTime<Utc>,
    /// Physical tools served
    pub tools: Vec<String>,
    /// Request statistics
    pub stats: ServerStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_and_display() {
        assert_eq!("Healthy".parse::<ServerStatus>().unwrap(), ServerStatus::Healthy);
        assert_eq!("offline".parse::<ServerStatus>().unwrap(), ServerStatus::Offline);
        assert!("sleepy".parse::<ServerStatus>().is_err());
        assert_eq!(ServerStatus::Unhealthy.to_string(), "unhealthy");
    }

    #[test]
    fn test_success_rate() {
        let mut server = ServerInstance::new("s1");
        assert!((server.success_rate() - 100.0).abs() < f64::EPSILON);

        server.total_requests = 4;
        server.failed_requests = 1;
        assert!((server.success_rate() - 75.0).abs() < f64::EPSILON);
        assert!((server.summary().stats.success_rate - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_registration_defaults_from_json() {
        let reg: ServerRegistration = serde_json::from_str(r#"{"name": "s1"}"#).unwrap();
        assert_eq!(reg.environment, "default");
        assert_eq!(reg.weight, 100);
        assert!(reg.tools.is_empty());
    }
}

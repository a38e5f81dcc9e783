//! End-to-end tests of the call pipeline with a scripted backend

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mcp_tool_gateway::audit::{AuditLogger, AuditQuery};
use mcp_tool_gateway::backend::ToolInvoker;
use mcp_tool_gateway::catalog::ToolCatalog;
use mcp_tool_gateway::config::{AuditConfig, GatewaySettings, HealthCheckConfig};
use mcp_tool_gateway::gateway::ToolGateway;
use mcp_tool_gateway::model::ToolCallStatus;
use mcp_tool_gateway::registry::{ServerRegistration, ServerRegistry, ServerStatus};
use mcp_tool_gateway::{Error, Result};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::TempDir;

const CATALOG: &str = r#"
tools:
  ping:
    description: ICMP reachability
    category: network
    bindings:
      - mcp_server: s1
        physical_tool: x
      - mcp_server: s1-prod
        physical_tool: x_prod
        environment: production
        priority: 5
  restart_service:
    category: ops
    bindings:
      - mcp_server: ops
        physical_tool: systemctl_restart
    permissions:
      allowed_agents: [ops_agent]
  shell:
    bindings:
      - mcp_server: ops
        physical_tool: run_shell
    permissions:
      dangerous_patterns: ["rm\\s+-rf", "mkfs"]
"#;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Echo,
    ConnectionError,
    ToolError,
    Hang,
}

/// Records every invocation and answers according to `mode`
struct ScriptedInvoker {
    mode: Mutex<Mode>,
    calls: Mutex<Vec<(String, String, Value)>>,
}

impl ScriptedInvoker {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    fn calls(&self) -> Vec<(String, String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn invoke(&self, server: &str, physical_tool: &str, params: Value) -> Result<Value> {
        self.calls
            .lock()
            .unwrap()
            .push((server.to_string(), physical_tool.to_string(), params));
        let mode = *self.mode.lock().unwrap();
        match mode {
            Mode::Echo => Ok(json!(format!("{physical_tool}@{server} ok"))),
            Mode::ConnectionError => Err(Error::Connection(format!("{server} refused"))),
            Mode::ToolError => Err(Error::ToolExecution("exit status 2".to_string())),
            Mode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }
        }
    }
}

struct Harness {
    _dir: TempDir,
    gateway: ToolGateway,
    registry: Arc<ServerRegistry>,
    invoker: Arc<ScriptedInvoker>,
    audit: Arc<AuditLogger>,
}

fn harness(mode: Mode) -> Harness {
    harness_with(mode, GatewaySettings::default())
}

fn harness_with(mode: Mode, settings: GatewaySettings) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let catalog_path = dir.path().join("tool_catalog.yaml");
    std::fs::write(&catalog_path, CATALOG).unwrap();

    let catalog = Arc::new(ToolCatalog::load(&catalog_path).unwrap());
    let registry = Arc::new(ServerRegistry::new(HealthCheckConfig {
        healthy_threshold: 2,
        unhealthy_threshold: 3,
    }));
    let invoker = ScriptedInvoker::new(mode);
    let audit = Arc::new(audit_logger(&dir.path().join("audit")));

    let gateway = ToolGateway::new(
        Arc::clone(&catalog),
        Arc::clone(&registry),
        Arc::clone(&invoker) as Arc<dyn ToolInvoker>,
        Arc::clone(&audit),
    )
    .with_settings(settings);

    Harness {
        _dir: dir,
        gateway,
        registry,
        invoker,
        audit,
    }
}

fn audit_logger(dir: &Path) -> AuditLogger {
    AuditLogger::new(&AuditConfig {
        directory: dir.to_path_buf(),
        max_result_length: 500,
        query_limit: 1000,
    })
    .unwrap()
}

async fn audit_count(audit: &AuditLogger, request_id: &str) -> usize {
    audit
        .query(&AuditQuery::default())
        .await
        .unwrap()
        .iter()
        .filter(|r| r.request_id == request_id)
        .count()
}

#[tokio::test]
async fn test_end_to_end_routed_call() {
    let h = harness(Mode::Echo);
    h.registry
        .register(ServerRegistration::new("s1", vec!["x".to_string()]));

    let result = h
        .gateway
        .call_tool("ping", json!({"target": "10.0.0.1"}), "net_agent", Some("sess-1".to_string()), None)
        .await;

    assert_eq!(result.status, ToolCallStatus::Success);
    assert_eq!(result.physical_tool, "x");
    assert_eq!(result.mcp_server, "s1");
    assert_eq!(result.result, Some(json!("x@s1 ok")));
    assert!(result.end_time.is_some());
    assert!(result.duration_ms >= 0.0);

    assert_eq!(
        h.invoker.calls(),
        vec![("s1".to_string(), "x".to_string(), json!({"target": "10.0.0.1"}))]
    );

    let server = h.registry.get_server("s1").unwrap();
    assert_eq!(server.total_requests, 1);
    assert_eq!(server.failed_requests, 0);

    let records = h
        .audit
        .query(&AuditQuery {
            session_id: Some("sess-1".to_string()),
            ..AuditQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].request_id, result.request_id);
    assert_eq!(records[0].mcp_server, "s1");
    assert_eq!(records[0].status, ToolCallStatus::Success);
    assert_eq!(records[0].result_summary.as_deref(), Some("x@s1 ok"));
}

#[tokio::test]
async fn test_unknown_tool_never_invokes() {
    let h = harness(Mode::Echo);
    let result = h
        .gateway
        .call_tool("teleport", json!({}), "agent", None, None)
        .await;

    assert_eq!(result.status, ToolCallStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("Unknown tool: teleport"));
    assert_eq!(result.physical_tool, "");
    assert!(h.invoker.calls().is_empty());
    assert_eq!(audit_count(&h.audit, &result.request_id).await, 1);
}

#[tokio::test]
async fn test_denied_caller_never_invokes() {
    let h = harness(Mode::Echo);
    h.registry
        .register(ServerRegistration::new("ops", vec!["systemctl_restart".to_string()]));

    for attempt in 1..=3 {
        let denied = h
            .gateway
            .call_tool("restart_service", json!({"unit": "nginx"}), "chat_agent", None, None)
            .await;
        assert_eq!(denied.status, ToolCallStatus::PermissionDenied);
        assert!(denied.error.as_deref().unwrap().contains("chat_agent"));
        assert!(h.invoker.calls().is_empty());
        assert_eq!(audit_count(&h.audit, &denied.request_id).await, 1);
        assert_eq!(h.audit.query(&AuditQuery::default()).await.unwrap().len(), attempt);
    }

    // denial leaves health and stats untouched
    let server = h.registry.get_server("ops").unwrap();
    assert_eq!(server.total_requests, 0);

    let allowed = h
        .gateway
        .call_tool("restart_service", json!({"unit": "nginx"}), "ops_agent", None, None)
        .await;
    assert_eq!(allowed.status, ToolCallStatus::Success);
    assert_eq!(h.invoker.calls().len(), 1);
}

#[tokio::test]
async fn test_dangerous_parameters_are_denied() {
    let h = harness(Mode::Echo);

    let denied = h
        .gateway
        .call_tool("shell", json!({"cmd": "rm -rf /var"}), "ops_agent", None, None)
        .await;
    assert_eq!(denied.status, ToolCallStatus::PermissionDenied);
    assert!(h.invoker.calls().is_empty());

    let nested = h
        .gateway
        .call_tool("shell", json!({"steps": [{"cmd": "mkfs.ext4 /dev/sdb"}]}), "ops_agent", None, None)
        .await;
    assert_eq!(nested.status, ToolCallStatus::PermissionDenied);
    assert!(h.invoker.calls().is_empty());

    let fine = h
        .gateway
        .call_tool("shell", json!({"cmd": "uptime"}), "ops_agent", None, None)
        .await;
    assert_eq!(fine.status, ToolCallStatus::Success);
}

#[tokio::test]
async fn test_environment_binding_and_fallback() {
    let h = harness(Mode::Echo);

    let prod = h
        .gateway
        .call_tool("ping", json!({}), "agent", None, Some("production"))
        .await;
    assert_eq!(prod.physical_tool, "x_prod");
    assert_eq!(prod.mcp_server, "s1-prod");

    // no staging binding: fall back to default, served by the declared server
    let staging = h
        .gateway
        .call_tool("ping", json!({}), "agent", None, Some("staging"))
        .await;
    assert_eq!(staging.status, ToolCallStatus::Success);
    assert_eq!(staging.physical_tool, "x");
    assert_eq!(staging.mcp_server, "s1");
}

#[tokio::test]
async fn test_connection_failures_demote_server() {
    let h = harness(Mode::ConnectionError);
    h.registry
        .register(ServerRegistration::new("s1", vec!["x".to_string()]));

    for _ in 0..2 {
        let result = h.gateway.call_tool("ping", json!({}), "agent", None, None).await;
        assert_eq!(result.status, ToolCallStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("Server connection error: s1 refused"));
        assert_eq!(audit_count(&h.audit, &result.request_id).await, 1);
    }
    assert_eq!(h.registry.get_server("s1").unwrap().status, ServerStatus::Healthy);

    h.gateway.call_tool("ping", json!({}), "agent", None, None).await;
    let server = h.registry.get_server("s1").unwrap();
    assert_eq!(server.status, ServerStatus::Unhealthy);
    assert_eq!(server.failed_requests, 3);

    // excluded from candidates: the declared server is used, without feedback
    h.invoker.set_mode(Mode::Echo);
    let fallback = h.gateway.call_tool("ping", json!({}), "agent", None, None).await;
    assert_eq!(fallback.status, ToolCallStatus::Success);
    assert_eq!(fallback.mcp_server, "s1");
    assert_eq!(h.registry.get_server("s1").unwrap().total_requests, 3);
}

#[tokio::test]
async fn test_reregistered_server_needs_fresh_failure_streak() {
    let h = harness(Mode::ConnectionError);
    h.registry
        .register(ServerRegistration::new("s1", vec!["x".to_string()]));
    for _ in 0..3 {
        h.gateway.call_tool("ping", json!({}), "agent", None, None).await;
    }
    assert_eq!(h.registry.get_server("s1").unwrap().status, ServerStatus::Unhealthy);

    h.registry
        .register(ServerRegistration::new("s1", vec!["x".to_string()]));
    let result = h.gateway.call_tool("ping", json!({}), "agent", None, None).await;
    assert_eq!(result.status, ToolCallStatus::Failed);
    assert_eq!(result.mcp_server, "s1");

    // one failure after a fresh announcement stays below the threshold
    let server = h.registry.get_server("s1").unwrap();
    assert_eq!(server.status, ServerStatus::Healthy);
    assert_eq!(server.consecutive_failures, 1);
    assert_eq!(h.registry.get_servers_for_tool("x").len(), 1);
}

#[tokio::test]
async fn test_tool_error_keeps_server_healthy() {
    let h = harness(Mode::ToolError);
    h.registry
        .register(ServerRegistration::new("s1", vec!["x".to_string()]));

    for _ in 0..5 {
        let result = h.gateway.call_tool("ping", json!({}), "agent", None, None).await;
        assert_eq!(result.status, ToolCallStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("Tool call error: exit status 2"));
    }
    let server = h.registry.get_server("s1").unwrap();
    assert_eq!(server.status, ServerStatus::Healthy);
    assert_eq!(server.failed_requests, 5);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_reported_and_audited() {
    let h = harness_with(
        Mode::Hang,
        GatewaySettings {
            call_timeout: Duration::from_secs(2),
            ..GatewaySettings::default()
        },
    );
    h.registry
        .register(ServerRegistration::new("s1", vec!["x".to_string()]));

    let result = h.gateway.call_tool("ping", json!({}), "agent", None, None).await;
    assert_eq!(result.status, ToolCallStatus::Timeout);
    assert!(result.error.as_deref().unwrap().starts_with("Timeout:"));
    assert_eq!(audit_count(&h.audit, &result.request_id).await, 1);

    let server = h.registry.get_server("s1").unwrap();
    assert_eq!(server.consecutive_failures, 1);
    assert_eq!(server.failed_requests, 1);
}

#[tokio::test]
async fn test_round_robin_across_registered_servers() {
    let h = harness(Mode::Echo);
    for name in ["s1", "s2", "s3"] {
        h.registry
            .register(ServerRegistration::new(name, vec!["x".to_string()]));
    }

    let mut servers = Vec::new();
    for _ in 0..6 {
        let result = h.gateway.call_tool("ping", json!({}), "agent", None, None).await;
        servers.push(result.mcp_server);
    }
    assert_eq!(servers, ["s1", "s2", "s3", "s1", "s2", "s3"]);
}

#[tokio::test]
async fn test_physical_name_paths_audit_once() {
    let h = harness(Mode::Echo);

    let mapped = h
        .gateway
        .call_tool_by_physical_name("x", json!({}), "legacy", None)
        .await;
    assert_eq!(mapped.logical_name, "ping");
    assert_eq!(audit_count(&h.audit, &mapped.request_id).await, 1);

    h.invoker.set_mode(Mode::ConnectionError);
    let direct = h
        .gateway
        .call_tool_by_physical_name("nslookup", json!({"domain": "example.com"}), "legacy", None)
        .await;
    assert_eq!(direct.status, ToolCallStatus::Failed);
    assert_eq!(direct.mcp_server, "unknown");
    assert_eq!(direct.physical_tool, "nslookup");
    assert_eq!(audit_count(&h.audit, &direct.request_id).await, 1);
}

#[tokio::test]
async fn test_concurrent_calls_each_audited() {
    let h = Arc::new(harness(Mode::Echo));
    for name in ["s1", "s2"] {
        h.registry
            .register(ServerRegistration::new(name, vec!["x".to_string()]));
    }

    let mut handles = Vec::new();
    for i in 0..32 {
        let h = Arc::clone(&h);
        handles.push(tokio::spawn(async move {
            h.gateway
                .call_tool("ping", json!({"target": format!("h{i}")}), "agent", None, None)
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().status, ToolCallStatus::Success);
    }

    let records = h.audit.query(&AuditQuery::default()).await.unwrap();
    assert_eq!(records.len(), 32);
    let total: u64 = ["s1", "s2"]
        .iter()
        .map(|s| h.registry.get_server(s).unwrap().total_requests)
        .sum();
    assert_eq!(total, 32);
}

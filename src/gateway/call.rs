//! The `call_tool` pipeline
//!
//! resolve binding → permission check → candidate discovery → route
//! selection → invoke → health feedback → audit. Every path ends in a
//! terminal [`ToolCallResult`] and exactly one audit record.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::Error;
use crate::audit::AuditLogger;
use crate::backend::ToolInvoker;
use crate::catalog::{ResolvedTool, ToolCatalog};
use crate::config::GatewaySettings;
use crate::model::{ToolCallRequest, ToolCallResult, ToolCallStatus};
use crate::registry::ServerRegistry;
use crate::routing::{RoundRobinStrategy, RoutingStrategy};

/// Server name recorded when a physical tool is invoked without a catalog entry
pub const UNKNOWN_SERVER: &str = "unknown";

/// Entry point for callers
pub struct ToolGateway {
    catalog: Arc<ToolCatalog>,
    registry: Arc<ServerRegistry>,
    invoker: Arc<dyn ToolInvoker>,
    audit: Arc<AuditLogger>,
    strategy: Arc<dyn RoutingStrategy>,
    settings: GatewaySettings,
}

impl ToolGateway {
    /// Gateway with round robin routing and default settings
    pub fn new(
        catalog: Arc<ToolCatalog>,
        registry: Arc<ServerRegistry>,
        invoker: Arc<dyn ToolInvoker>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            catalog,
            registry,
            invoker,
            audit,
            strategy: Arc::new(RoundRobinStrategy::new()),
            settings: GatewaySettings::default(),
        }
    }

    /// Use `strategy` to pick among healthy candidates
    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn RoutingStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Replace the call settings
    #[must_use]
    pub fn with_settings(mut self, settings: GatewaySettings) -> Self {
        self.settings = settings;
        self
    }

    /// The catalog this gateway resolves against
    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    /// The registry this gateway routes over
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Name of the active routing strategy
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Invoke a logical tool
    ///
    /// `environment` defaults to the configured default environment.
    #[tracing::instrument(skip(self, params), fields(caller = %caller_agent))]
    pub async fn call_tool(
        &self,
        logical_name: &str,
        params: Value,
        caller_agent: &str,
        session_id: Option<String>,
        environment: Option<&str>,
    ) -> ToolCallResult {
        let request = ToolCallRequest::new(logical_name, params, caller_agent, session_id);
        let environment = environment.unwrap_or(&self.settings.default_environment);
        let result = self.run(&request, environment).await;
        self.audit.log_call(&request, &result).await;
        result
    }

    async fn run(&self, request: &ToolCallRequest, environment: &str) -> ToolCallResult {
        let mut result = ToolCallResult::for_request(request);
        let logical_name = request.logical_name();

        let Some(resolved) = self.catalog.resolve(logical_name, environment) else {
            warn!(request_id = %request.request_id(), tool = %logical_name, environment, "Unknown tool");
            let error = Error::UnknownTool(logical_name.to_string());
            finish(&mut result, ToolCallStatus::Failed, None, Some(error.to_string()));
            return result;
        };
        let binding = &resolved.binding;
        result.set_target(&binding.mcp_server, &binding.physical_tool);

        if let Some(reason) = denial(&resolved, request) {
            warn!(request_id = %request.request_id(), tool = %logical_name, "Call denied");
            let error = Error::PermissionDenied(reason);
            finish(&mut result, ToolCallStatus::PermissionDenied, None, Some(error.to_string()));
            return result;
        }

        let candidates = self.registry.get_servers_for_tool(&binding.physical_tool);
        let selected = self
            .strategy
            .select(&candidates, request.params())
            .map(|s| s.name.clone());
        match &selected {
            Some(server) => {
                debug!(request_id = %request.request_id(), server = %server, strategy = self.strategy.name(), "Routed");
                result.mcp_server.clone_from(server);
            }
            None => {
                debug!(request_id = %request.request_id(), server = %binding.mcp_server, "No healthy candidates, using declared server");
            }
        }

        result.mark_running();
        info!(
            request_id = %request.request_id(),
            tool = %logical_name,
            physical_tool = %result.physical_tool,
            server = %result.mcp_server,
            "Invoking tool"
        );

        let outcome = self
            .invoke(&result.mcp_server, &result.physical_tool, request.params().clone())
            .await;

        if let Some(server) = &selected {
            self.feedback(server, &outcome);
        }
        settle(&mut result, outcome);
        result
    }

    async fn invoke(&self, server: &str, physical_tool: &str, params: Value) -> crate::Result<Value> {
        let deadline = self.settings.call_timeout;
        match tokio::time::timeout(deadline, self.invoker.invoke(server, physical_tool, params)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout(format!(
                "'{physical_tool}' on '{server}' exceeded {}ms",
                deadline.as_millis()
            ))),
        }
    }

    /// Feed a call outcome back into the registry
    ///
    /// A tool that ran and failed still proves the server is reachable.
    fn feedback(&self, server: &str, outcome: &crate::Result<Value>) {
        match outcome {
            Ok(_) => {
                self.registry.record_request(server, true);
                self.registry.mark_healthy(server);
            }
            Err(Error::ToolExecution(_)) => {
                self.registry.record_request(server, false);
                self.registry.mark_healthy(server);
            }
            Err(_) => {
                self.registry.record_request(server, false);
                self.registry.mark_unhealthy(server);
            }
        }
    }

    /// Invoke a physical tool by name
    ///
    /// Tools known to the catalog go through [`ToolGateway::call_tool`] in the
    /// default environment. Others are invoked directly, with no routing or
    /// health feedback, and recorded against server `"unknown"`.
    pub async fn call_tool_by_physical_name(
        &self,
        physical_tool: &str,
        params: Value,
        caller_agent: &str,
        session_id: Option<String>,
    ) -> ToolCallResult {
        if let Some(logical_name) = self.catalog.get_logical_name(physical_tool) {
            return self
                .call_tool(&logical_name, params, caller_agent, session_id, None)
                .await;
        }

        let request = ToolCallRequest::new(physical_tool, params, caller_agent, session_id);
        let mut result = ToolCallResult::for_request(&request);
        result.set_target(UNKNOWN_SERVER, physical_tool);
        result.mark_running();
        debug!(request_id = %request.request_id(), tool = %physical_tool, "Direct physical invocation");

        let outcome = self
            .invoke(UNKNOWN_SERVER, physical_tool, request.params().clone())
            .await;
        settle(&mut result, outcome);

        self.audit.log_call(&request, &result).await;
        result
    }
}

/// Complete `result` from an invocation outcome
/// Reason the caller may not run this call, if any
fn denial(resolved: &ResolvedTool, request: &ToolCallRequest) -> Option<String> {
    if !resolved.allows(request.caller_agent()) {
        return Some(format!(
            "agent '{}' may not call '{}'",
            request.caller_agent(),
            request.logical_name()
        ));
    }
    resolved
        .dangerous_match(request.params())
        .map(|pattern| format!("parameters match dangerous pattern '{pattern}'"))
}

fn settle(result: &mut ToolCallResult, outcome: crate::Result<Value>) {
    match outcome {
        Ok(payload) => {
            info!(request_id = %result.request_id, tool = %result.logical_name, "Tool call succeeded");
            finish(result, ToolCallStatus::Success, Some(payload), None);
        }
        Err(e) if e.is_timeout() => {
            error!(request_id = %result.request_id, tool = %result.logical_name, error = %e, "Tool call timed out");
            finish(result, ToolCallStatus::Timeout, None, Some(e.to_string()));
        }
        Err(e) => {
            error!(request_id = %result.request_id, tool = %result.logical_name, error = %e, "Tool call failed");
            finish(result, ToolCallStatus::Failed, None, Some(e.to_string()));
        }
    }
}

fn finish(
    result: &mut ToolCallResult,
    status: ToolCallStatus,
    payload: Option<Value>,
    error: Option<String>,
) {
    if let Err(e) = result.complete(status, payload, error) {
        error!(request_id = %result.request_id, error = %e, "Result already finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServerRegistration;
    use gateway_core::{ToolBinding, ToolDefinition};
    use serde_json::json;

    struct Echo;

    #[async_trait::async_trait]
    impl ToolInvoker for Echo {
        async fn invoke(&self, server: &str, physical_tool: &str, _params: Value) -> crate::Result<Value> {
            Ok(json!(format!("{physical_tool}@{server}")))
        }
    }

    fn gateway(dir: &std::path::Path) -> ToolGateway {
        let catalog = ToolCatalog::from_definitions(vec![ToolDefinition::new(
            "ping",
            vec![ToolBinding::new("net", "ping_host")],
        )])
        .unwrap();
        let audit = AuditLogger::new(&crate::config::AuditConfig {
            directory: dir.to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        ToolGateway::new(
            Arc::new(catalog),
            Arc::new(ServerRegistry::default()),
            Arc::new(Echo),
            Arc::new(audit),
        )
    }

    #[tokio::test]
    async fn test_declared_server_without_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway(dir.path());
        let result = gateway.call_tool("ping", json!({}), "agent", None, None).await;
        assert_eq!(result.status, ToolCallStatus::Success);
        assert_eq!(result.mcp_server, "net");
        assert_eq!(result.result, Some(json!("ping_host@net")));
    }

    #[tokio::test]
    async fn test_routed_server_overrides_declared() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway(dir.path());
        gateway
            .registry()
            .register(ServerRegistration::new("net-2", vec!["ping_host".to_string()]));

        let result = gateway.call_tool("ping", json!({}), "agent", None, None).await;
        assert_eq!(result.mcp_server, "net-2");
        let server = gateway.registry().get_server("net-2").unwrap();
        assert_eq!(server.total_requests, 1);
    }

    #[tokio::test]
    async fn test_physical_name_resolves_to_logical() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway(dir.path());
        let result = gateway
            .call_tool_by_physical_name("ping_host", json!({}), "agent", None)
            .await;
        assert_eq!(result.logical_name, "ping");
        assert_eq!(result.mcp_server, "net");

        let direct = gateway
            .call_tool_by_physical_name("traceroute", json!({}), "agent", None)
            .await;
        assert_eq!(direct.logical_name, "traceroute");
        assert_eq!(direct.mcp_server, UNKNOWN_SERVER);
        assert_eq!(direct.physical_tool, "traceroute");
        assert_eq!(direct.status, ToolCallStatus::Success);
    }
}

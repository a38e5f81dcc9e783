//! Registry HTTP surface tests

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use mcp_tool_gateway::catalog::ToolCatalog;
use mcp_tool_gateway::gateway::{AppState, create_router};
use mcp_tool_gateway::registry::{ServerRegistry, ServerStatus};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

fn app() -> (Router, Arc<ServerRegistry>) {
    let registry = Arc::new(ServerRegistry::default());
    let state = Arc::new(AppState {
        registry: Arc::clone(&registry),
        catalog: Arc::new(ToolCatalog::empty()),
    });
    (create_router(state), registry)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_register_then_inspect() {
    let (app, registry) = app();

    let (status, body) = send(
        &app,
        "POST",
        "/registry/register",
        Some(json!({
            "name": "netprobe-1",
            "description": "network probes",
            "environment": "production",
            "weight": 200,
            "tools": ["ping", "traceroute"]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["name"], json!("netprobe-1"));
    assert_eq!(body["data"]["status"], json!("healthy"));
    assert_eq!(body["data"]["weight"], json!(200));

    assert_eq!(registry.get_servers_for_tool("traceroute").len(), 1);

    let (status, body) = send(&app, "GET", "/registry/servers/netprobe-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["environment"], json!("production"));
    assert_eq!(body["tools"], json!(["ping", "traceroute"]));
}

#[tokio::test]
async fn test_register_defaults_and_weight_bounds() {
    let (app, registry) = app();

    let (status, _) = send(
        &app,
        "POST",
        "/registry/register",
        Some(json!({"name": "plain"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let server = registry.get_server("plain").unwrap();
    assert_eq!(server.weight, 100);
    assert_eq!(server.environment, "default");

    for weight in [0, 1001] {
        let (status, body) = send(
            &app,
            "POST",
            "/registry/register",
            Some(json!({"name": "heavy", "weight": weight})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["success"], json!(false));
    }
    assert!(registry.get_server("heavy").is_none());

    // missing name is a body error
    let (status, _) = send(&app, "POST", "/registry/register", Some(json!({"weight": 5}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_heartbeat_and_deregister() {
    let (app, registry) = app();
    send(
        &app,
        "POST",
        "/registry/register",
        Some(json!({"name": "s1", "tools": ["x"]})),
    )
    .await;
    registry.mark_unhealthy("s1");
    registry.mark_unhealthy("s1");
    registry.mark_unhealthy("s1");
    assert_eq!(registry.get_server("s1").unwrap().status, ServerStatus::Unhealthy);

    let (status, body) = send(&app, "POST", "/registry/heartbeat", Some(json!({"name": "s1"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(registry.get_server("s1").unwrap().status, ServerStatus::Healthy);

    let (status, body) = send(&app, "POST", "/registry/heartbeat", Some(json!({"name": "ghost"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], json!(false));

    let (status, _) = send(&app, "POST", "/registry/deregister", Some(json!({"name": "s1"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(registry.get_servers_for_tool("x").is_empty());

    let (status, _) = send(&app, "POST", "/registry/deregister", Some(json!({"name": "s1"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "GET", "/registry/servers/s1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_filters() {
    let (app, registry) = app();
    for (name, env) in [("a", "production"), ("b", "staging"), ("c", "production")] {
        send(
            &app,
            "POST",
            "/registry/register",
            Some(json!({"name": name, "environment": env})),
        )
        .await;
    }
    for _ in 0..3 {
        registry.mark_unhealthy("c");
    }

    let (status, body) = send(&app, "GET", "/registry/servers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 3);

    let (_, body) = send(&app, "GET", "/registry/servers?environment=production", None).await;
    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["a", "c"]);

    let (_, body) = send(
        &app,
        "GET",
        "/registry/servers?environment=production&status=healthy",
        None,
    )
    .await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["name"], json!("a"));

    let (status, _) = send(&app, "GET", "/registry/servers?status=sleepy", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_counts() {
    let (app, registry) = app();
    for name in ["a", "b"] {
        send(&app, "POST", "/registry/register", Some(json!({"name": name}))).await;
    }
    for _ in 0..3 {
        registry.mark_unhealthy("b");
    }

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["servers"], json!(2));
    assert_eq!(body["healthy"], json!(1));
}

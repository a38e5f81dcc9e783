//! Registry HTTP surface
//!
//! A thin shim over [`ServerRegistry`]: backends register, heartbeat and
//! deregister themselves; operators list and inspect them.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::catalog::ToolCatalog;
use crate::registry::{ServerFilter, ServerRegistration, ServerRegistry, ServerStatus};

/// Accepted registration weights
pub const WEIGHT_RANGE: std::ops::RangeInclusive<u32> = 1..=1000;

/// Shared application state
pub struct AppState {
    /// Live server directory
    pub registry: Arc<ServerRegistry>,
    /// Tool catalog, reported by `/health`
    pub catalog: Arc<ToolCatalog>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/registry/register", post(register_handler))
        .route("/registry/heartbeat", post(heartbeat_handler))
        .route("/registry/deregister", post(deregister_handler))
        .route("/registry/servers", get(list_handler))
        .route("/registry/servers/{name}", get(server_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Body of every mutating registry call
#[derive(Debug, Serialize)]
struct RegistryResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl RegistryResponse {
    fn ok(message: String, data: Option<Value>) -> Response {
        Json(Self {
            success: true,
            message,
            data,
        })
        .into_response()
    }

    fn fail(status: StatusCode, message: String) -> Response {
        (
            status,
            Json(Self {
                success: false,
                message,
                data: None,
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct NameRequest {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    environment: Option<String>,
    status: Option<String>,
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "servers": state.registry.len(),
        "healthy": state.registry.get_healthy_servers(None).len(),
        "tools": state.catalog.len(),
    }))
}

/// POST /registry/register
async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<ServerRegistration>,
) -> Response {
    if registration.name.trim().is_empty() {
        return RegistryResponse::fail(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Server name must not be empty".to_string(),
        );
    }
    if !WEIGHT_RANGE.contains(&registration.weight) {
        return RegistryResponse::fail(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!(
                "Weight {} outside {}..={}",
                registration.weight,
                WEIGHT_RANGE.start(),
                WEIGHT_RANGE.end()
            ),
        );
    }

    let server = state.registry.register(registration);
    info!(server = %server.name, tools = server.tools.len(), "Registered via API");
    let data = serde_json::to_value(server.summary()).ok();
    RegistryResponse::ok(format!("Server {} registered", server.name), data)
}

/// POST /registry/heartbeat
async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NameRequest>,
) -> Response {
    if state.registry.heartbeat(&request.name) {
        debug!(server = %request.name, "Heartbeat via API");
        RegistryResponse::ok(format!("Heartbeat received: {}", request.name), None)
    } else {
        RegistryResponse::fail(
            StatusCode::NOT_FOUND,
            format!("Unknown server: {}", request.name),
        )
    }
}

/// POST /registry/deregister
async fn deregister_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NameRequest>,
) -> Response {
    if state.registry.deregister(&request.name) {
        info!(server = %request.name, "Deregistered via API");
        RegistryResponse::ok(format!("Server {} deregistered", request.name), None)
    } else {
        RegistryResponse::fail(
            StatusCode::NOT_FOUND,
            format!("Unknown server: {}", request.name),
        )
    }
}

/// GET /registry/servers
async fn list_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Response {
    let status = match params.status.as_deref().map(str::parse::<ServerStatus>) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => return RegistryResponse::fail(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let filter = ServerFilter {
        environment: params.environment,
        status,
    };
    Json(state.registry.list_servers(&filter)).into_response()
}

/// GET /registry/servers/{name}
async fn server_handler(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.registry.get_server(&name) {
        Some(server) => Json(server.summary()).into_response(),
        None => RegistryResponse::fail(StatusCode::NOT_FOUND, format!("Unknown server: {name}")),
    }
}

//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, warn};

use super::call::ToolGateway;
use super::router::{AppState, create_router};
use crate::audit::AuditLogger;
use crate::backend::ConnectionManager;
use crate::catalog::{CatalogWatcher, ToolCatalog};
use crate::config::Config;
use crate::registry::{HeartbeatChecker, ServerRegistry};
use crate::routing::StrategyFactory;
use crate::{Error, Result};

/// Process-scoped services, built once from configuration
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Tool catalog
    catalog: Arc<ToolCatalog>,
    /// Live server directory
    registry: Arc<ServerRegistry>,
    /// Backend sessions
    backends: Arc<ConnectionManager>,
    /// Call pipeline
    tools: Arc<ToolGateway>,
}

impl Gateway {
    /// Build every service from `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be loaded or the audit
    /// directory cannot be created.
    pub fn new(config: Config) -> Result<Self> {
        let catalog = Arc::new(ToolCatalog::load(config.catalog.path.clone())?);
        let registry = Arc::new(ServerRegistry::from_config(&config.registry));
        let backends = Arc::new(ConnectionManager::from_config(&config));
        let audit = Arc::new(AuditLogger::new(&config.audit)?);

        let routing = &config.registry.routing;
        let strategy = StrategyFactory::new(routing.strategies.clone()).get(&routing.default_strategy);
        info!(strategy = strategy.name(), "Routing strategy selected");

        let tools = Arc::new(
            ToolGateway::new(
                Arc::clone(&catalog),
                Arc::clone(&registry),
                Arc::clone(&backends) as Arc<dyn crate::backend::ToolInvoker>,
                audit,
            )
            .with_strategy(strategy)
            .with_settings(config.gateway.clone()),
        );

        Ok(Self {
            config,
            catalog,
            registry,
            backends,
            tools,
        })
    }

    /// The in-process `call_tool` entry point
    pub fn tools(&self) -> Arc<ToolGateway> {
        Arc::clone(&self.tools)
    }

    /// Run until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address is invalid or cannot be bound.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        // bind first so a taken port never leaves backend children behind
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let summary = self.backends.start_all_servers().await;
        if !summary.failed.is_empty() {
            warn!(failed = summary.failed.len(), "Some backends failed to start");
        }

        let checker = self.config.registry.heartbeat.enabled.then(|| {
            HeartbeatChecker::spawn(Arc::clone(&self.registry), self.config.registry.heartbeat)
        });

        let _catalog_watcher = if self.config.catalog.watch {
            match CatalogWatcher::start(Arc::clone(&self.catalog), shutdown_tx.subscribe()) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!(error = %e, "Failed to start catalog watcher, hot-reload disabled");
                    None
                }
            }
        } else {
            None
        };

        let state = Arc::new(AppState {
            registry: Arc::clone(&self.registry),
            catalog: Arc::clone(&self.catalog),
        });
        let app = create_router(state);

        info!(version = env!("CARGO_PKG_VERSION"), %addr, "Tool gateway listening");
        info!(
            tools = self.catalog.len(),
            servers = self.registry.len(),
            backends = summary.started.len(),
            strategy = self.tools.strategy_name(),
            "Gateway ready"
        );

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()));

        info!("Shutting down");
        if let Some(checker) = checker {
            checker.stop().await;
        }
        let stop = self.backends.stop_all_servers();
        if tokio::time::timeout(self.config.server.shutdown_timeout, stop)
            .await
            .is_err()
        {
            error!("Backends did not stop within the shutdown timeout");
        }

        served
    }
}

/// Resolves on Ctrl+C or SIGTERM and tells background tasks to stop
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    if shutdown_tx.send(()).is_err() {
        debug!("No shutdown listeners");
    }
}

//! API Server

use super::{
    handlers::AppState,
    middleware::{create_cors_layer, request_id_middleware},
    routes::create_router,
};
use crate::config::ApiConfig;
use crate::session::GameEngine;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

/// HTTP front end over a shared `GameEngine`
pub struct ApiServer {
    config: ApiConfig,
    engine: Arc<GameEngine>,
    metrics_enabled: bool,
}

impl ApiServer {
    pub fn new(config: ApiConfig, engine: Arc<GameEngine>, metrics_enabled: bool) -> Self {
        Self {
            config,
            engine,
            metrics_enabled,
        }
    }

    /// Serve until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let app = self.create_app();
        let addr = self.get_socket_addr()?;

        info!("Starting fairplay API server on http://{}", addr);
        self.log_server_info();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("API server stopped gracefully");
        Ok(())
    }

    fn create_app(&self) -> axum::Router {
        build_app(self.engine.clone(), &self.config, self.metrics_enabled)
    }

    fn get_socket_addr(&self) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        Ok(SocketAddr::from((
            self.config.host.parse::<std::net::IpAddr>()?,
            self.config.port,
        )))
    }

    fn log_server_info(&self) {
        info!("   CORS: {:?}", self.config.cors_origins);
        info!("   Request timeout: {}s", self.config.request_timeout_secs);
        info!("   Metrics enabled: {}", self.metrics_enabled);
        info!("   Admin routes: {}", if self.config.admin_token.is_some() { "enabled" } else { "disabled" });
        info!("   Idle session timeout: {}s", self.engine.config().session_idle_timeout_secs);
    }
}

/// Router plus the middleware stack; also used directly by router tests
pub fn build_app(engine: Arc<GameEngine>, config: &ApiConfig, metrics_enabled: bool) -> axum::Router {
    let state = Arc::new(AppState {
        engine,
        version: env!("CARGO_PKG_VERSION").to_string(),
        metrics_enabled,
    });

    create_router(state, config.admin_token.as_deref())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(create_cors_layer(config.cors_origins.clone()))
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)))
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}

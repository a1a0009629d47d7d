//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{any, get},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use agentcell_core::config::GatewayConfig;
use agentcell_registry::AgentRegistry;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AgentRegistry>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/agents/state", get(super::routes::agents_state))
        .route(
            "/agents/{agent_type}/{*path}",
            any(super::routes::forward_to_instance),
        )
        .layer(
            CorsLayer::new()
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers(Any)
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server.
pub async fn serve(config: &GatewayConfig, registry: Arc<AgentRegistry>) -> anyhow::Result<()> {
    let app = build_router(AppState::new(registry));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Gateway listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

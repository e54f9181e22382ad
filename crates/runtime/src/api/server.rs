//! HTTP server assembly.

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::routes::{self, AppState};
use crate::types::ControlPlaneError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct HttpApiConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for HttpApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
            enable_cors: true,
        }
    }
}

/// Build the ingress router.
pub fn build_router(state: AppState, config: &HttpApiConfig) -> Router {
    let mut router = Router::new()
        .route("/health", get(routes::health))
        .route("/process", post(routes::process))
        .route("/agents", get(routes::list_agents))
        .route("/patterns", get(routes::patterns))
        .route("/tools", get(routes::list_tools))
        .route("/tool/:name", post(routes::invoke_tool))
        .route("/compliance/metrics", get(routes::compliance_metrics))
        .route("/compliance/audit", get(routes::audit_trail))
        .route("/policies/reload", post(routes::reload_policies))
        .route("/metrics", get(routes::metrics_snapshot))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if config.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }
    router
}

/// Bind and serve until the process exits.
pub async fn serve(state: AppState, config: HttpApiConfig) -> Result<(), ControlPlaneError> {
    let address = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| ControlPlaneError::Internal(format!("failed to bind {address}: {e}")))?;
    info!(%address, "control plane API listening");

    axum::serve(listener, build_router(state, &config))
        .await
        .map_err(|e| ControlPlaneError::Internal(format!("server error: {e}")))
}

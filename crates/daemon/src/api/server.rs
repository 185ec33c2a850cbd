/// API Server implementation
use super::handlers::*;
use crate::runtime::CoreHandle;
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Operator API server exposing the relay core's control surface
pub struct ApiServer {
    listen_addr: SocketAddr,
    core: CoreHandle,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(listen_addr: SocketAddr, core: CoreHandle) -> Self {
        Self { listen_addr, core }
    }

    /// Start the API server
    pub async fn start(self) -> Result<()> {
        let state = AppState {
            core: self.core.clone(),
        };

        // Build the router with all endpoints
        let app = Router::new()
            // Health check
            .route("/health", get(health))
            // Relay-core endpoints
            .route("/api/status", get(get_status))
            .route("/api/channels", get(list_channels))
            .route("/api/circuits", get(list_circuits))
            .route("/api/circuits/:id/close", post(close_circuit))
            // Add CORS middleware for local tooling
            .layer(CorsLayer::permissive())
            // Add shared state
            .with_state(state);

        info!("API server starting on {}", self.listen_addr);

        // Start the server
        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;

        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("API server error: {}", e))?;

        Ok(())
    }
}

// src/server/metrics_server.rs

use crate::core::metrics::gather_metrics;
use crate::core::state::AppState;
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Handles HTTP requests to the metrics endpoint.
///
/// Dynamic gauges are refreshed before gathering so scrapes always see
/// current values.
async fn metrics_handler(state: Arc<AppState>) -> impl IntoResponse {
    if let Ok(members) = state.registry.members().await {
        crate::core::metrics::CLUSTER_SIZE.set(members.len() as f64);
    }
    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Runs a simple HTTP server exposing Prometheus metrics.
pub async fn run_metrics_server(state: Arc<AppState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let listen = state.config.metrics.listen.clone();
    let path = state.config.metrics.path.clone();
    let app = Router::new().route(&path, get(move || metrics_handler(state.clone())));

    info!("Prometheus metrics server listening on http://{}{}", listen, path);

    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server on {}: {}", listen, e);
            return;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await
        .ok();
}

pub mod monitoring;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use monitoring::EXPORT_METRICS;
use prometheus_client::encoding::text::encode;
use tracing::error;

use crate::health::HealthStatus;
use crate::state::AppState;

async fn health_handler(state: State<Arc<AppState>>) -> (StatusCode, String) {
    match state.health.check(state.sink_probe.as_ref()).await {
        HealthStatus::Healthy => (StatusCode::OK, "Healthy".to_string()),
        HealthStatus::Unhealthy(reason) => (StatusCode::SERVICE_UNAVAILABLE, reason),
    }
}

async fn expose_metrics(state: State<Arc<AppState>>) -> (StatusCode, String) {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    match encode(&mut buffer, &registry) {
        Ok(()) => (StatusCode::OK, buffer),
        Err(err) => {
            error!(event = "metrics_encode_failed", error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .with_state(state)
}

/// Registers the export metrics and starts the health/metrics HTTP server on `addr`.
///
/// The server stops when `state.shutdown_token` is cancelled.
pub async fn setup_server_with_addr(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    {
        let mut registry = state.registry.write().await;
        let metrics = EXPORT_METRICS.get().cloned().unwrap_or_default();
        metrics.register_into(&mut registry, "exporter");
        // A second server in the same process re-registers the handles it cloned above.
        let _ = EXPORT_METRICS.set(metrics);
        monitoring::register_build_info_metric(&mut registry, "worker");
    }

    let shutdown_token = state.shutdown_token.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_handle = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;
        if let Err(err) = served {
            error!(event = "server_failed", error = %err, "health/metrics server failed");
        }
    });

    Ok(server_handle)
}

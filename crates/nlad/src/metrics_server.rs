//! HTTP endpoint for Prometheus scraping
//!
//! Serves the process registry as text on `/metrics` and a liveness check on
//! `/health`. Plain HTTP, meant for a localhost or management address.

use crate::error::{NladError, Result};
use crate::metrics::NladMetrics;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct MetricsServer {
    listener: TcpListener,
    metrics: NladMetrics,
}

impl MetricsServer {
    pub async fn bind(addr: &str, metrics: NladMetrics) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            NladError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to bind metrics endpoint on {}: {}", addr, e),
            ))
        })?;
        info!(address = %addr, "Metrics endpoint listening");
        Ok(Self { listener, metrics })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Serves until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let app = router(self.metrics);
        let result = axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Metrics endpoint failed");
        }
    }
}

fn router(metrics: NladMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<NladMetrics>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", prometheus::TEXT_FORMAT)],
        metrics.render(),
    )
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

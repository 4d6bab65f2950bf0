use std::sync::Arc;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use derive_new::new;
use tokio::task::JoinHandle;

use crate::CoreMetrics;

/// A server that serves agent-specific routes
#[derive(new, Debug)]
pub struct Server {
    listen_port: u16,
    core_metrics: Arc<CoreMetrics>,
}

impl Server {
    /// Run an HTTP server serving agent-specific different routes
    ///
    /// routes:
    ///  - metrics - serving OpenMetrics format reports on `/metrics`
    ///  - custom_routes - additional routes to be served by the server as per the specific agent
    pub fn run_with_custom_router(self: Arc<Self>, router: Router) -> JoinHandle<eyre::Result<()>> {
        let port = self.listen_port;
        tracing::info!(port, "starting server on 0.0.0.0");

        let app = self.router().merge(router);

        tokio::spawn(async move {
            let url = format!("0.0.0.0:{}", port);
            let listener = tokio::net::TcpListener::bind(url).await?;
            axum::serve(listener, app).await?;
            Ok(())
        })
    }

    fn router(&self) -> Router {
        let core_metrics = self.core_metrics.clone();
        Router::new().route(
            "/metrics",
            get(move || Self::gather_metrics(core_metrics.clone())),
        )
    }

    /// Gather available metrics into an encoded (plaintext, OpenMetrics format)
    /// report.
    async fn gather_metrics(core_metrics: Arc<CoreMetrics>) -> impl IntoResponse {
        tracing::debug!("Traversing route for /metrics endpoint for serving Prometheus metrics");
        match core_metrics.gather() {
            Ok(metrics) => match String::from_utf8(metrics) {
                Ok(metrics_string) => (StatusCode::OK, metrics_string),
                Err(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".into(),
                ),
            },
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to gather metrics".into(),
            ),
        }
    }
}

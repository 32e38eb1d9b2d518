//! Localhost admin plane: probes and metrics.
//!
//! Served on its own port (default 8081, `CORSRELAY_ADMIN_PORT`) so that
//! monitoring keeps working while the relay port is saturated, and so none
//! of these endpoints are reachable by relay clients. Routes:
//!
//! - `GET /health` and `GET /ready` from [`crate::lifecycle`]
//! - `GET /metrics` in OpenMetrics text format

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::lifecycle::{LifecycleManager, health_router};
use crate::ports::admin_port;

const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Admin HTTP server. Build with [`AdminServer::new`], then either serve it
/// with [`run`](AdminServer::run) or embed [`router`](AdminServer::router)
/// behind a listener of your own.
pub struct AdminServer {
    lifecycle: Arc<LifecycleManager>,
    registry: Arc<Registry>,
    bind_addr: String,
    port: u16,
}

impl AdminServer {
    /// Admin server on `127.0.0.1:<CORSRELAY_ADMIN_PORT>`.
    pub fn new(lifecycle: Arc<LifecycleManager>, registry: Arc<Registry>) -> Self {
        Self {
            lifecycle,
            registry,
            bind_addr: "127.0.0.1".to_string(),
            port: admin_port(),
        }
    }

    /// Override the bind address and port.
    #[must_use]
    pub fn bind_to(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.bind_addr = addr.into();
        self.port = port;
        self
    }

    /// Probe routes plus `/metrics`.
    pub fn router(&self) -> Router {
        let metrics = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.registry.clone());
        health_router(self.lifecycle.clone()).merge(metrics)
    }

    /// Bind and serve until `shutdown` fires.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = format!("{}:{}", self.bind_addr, self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %addr, "Admin listener up");

        let router = self.router();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Admin listener closed");
        Ok(())
    }
}

/// Encode the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> Response {
    let mut body = String::new();
    match prometheus_client::encoding::text::encode(&mut body, &registry) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

//! In-process relay instance for integration tests.
//!
//! Boots the full pipeline (dispatcher, rate limiter, metrics, admin
//! surface) on ephemeral ports without spawning the binary, so tests stay
//! deterministic and need no prior build step.

#![allow(dead_code)]

use corsrelay::admin::AdminServer;
use corsrelay::lifecycle::{LifecycleConfig, LifecycleManager};
use corsrelay::metrics::RelayMetrics;
use corsrelay::rate_limiter::ClientRateLimiter;
use corsrelay::relay_config::RelayConfig;
use corsrelay::relay_service::RelayService;
use http_body_util::BodyExt;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A relay listening on an ephemeral port, with its admin surface on
/// another.
pub struct RelayHarness {
    pub relay_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    shutdown: CancellationToken,
    _accept_task: JoinHandle<()>,
    _admin_task: JoinHandle<()>,
}

impl RelayHarness {
    /// Spawn a relay with default configuration.
    pub async fn spawn() -> Self {
        Self::spawn_with(RelayConfig::default()).await
    }

    /// Spawn a relay with the given configuration.
    pub async fn spawn_with(config: RelayConfig) -> Self {
        let config = Arc::new(config);

        let mut registry = prometheus_client::registry::Registry::default();
        let metrics = Arc::new(RelayMetrics::new(&mut registry));
        let registry = Arc::new(registry);

        let shutdown = CancellationToken::new();
        let stream_stop = CancellationToken::new();

        let limiter = Arc::new(ClientRateLimiter::new(
            config.rate_limit.clone(),
            Duration::from_secs(config.rate_limit_stale_secs),
        ));

        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        lifecycle.mark_config_loaded();

        let service = RelayService::new(config, limiter, metrics, stream_stop)
            .expect("relay service should build");
        lifecycle.mark_client_ready();
        lifecycle.mark_ready();

        // Admin router on its own ephemeral listener
        let admin_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind admin listener");
        let admin_addr = admin_listener.local_addr().expect("admin local addr");
        let admin_router = AdminServer::new(lifecycle, registry).router();
        let admin_task = tokio::spawn(async move {
            axum::serve(admin_listener, admin_router)
                .await
                .expect("admin serve");
        });

        // Relay listener with the same per-connection serving as the binary
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind relay listener");
        let relay_addr = listener.local_addr().expect("relay local addr");

        let accept_shutdown = shutdown.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let Ok((stream, peer_addr)) = result else { break };
                        let service = service.clone();
                        tokio::spawn(serve_connection(stream, peer_addr, service));
                    }
                    _ = accept_shutdown.cancelled() => break,
                }
            }
        });

        Self {
            relay_addr,
            admin_addr,
            shutdown,
            _accept_task: accept_task,
            _admin_task: admin_task,
        }
    }

    /// Base URL of the relay listener.
    pub fn relay_url(&self) -> String {
        format!("http://{}", self.relay_addr)
    }

    /// Base URL of the admin listener.
    pub fn admin_url(&self) -> String {
        format!("http://{}", self.admin_addr)
    }
}

impl Drop for RelayHarness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    service: RelayService,
) {
    let io = TokioIo::new(stream);
    let svc_fn = hyper::service::service_fn(move |req| {
        let service = service.clone();
        async move {
            let result: Result<_, std::convert::Infallible> =
                match service.handle_request(req, peer_addr).await {
                    Ok(response) => Ok(response.map(|body| {
                        body.map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.into() })
                            .boxed()
                    })),
                    Err(e) => Ok(e
                        .to_response()
                        .map(|body| body.map_err(|e| match e {}).boxed())),
                };
            result
        }
    });

    let _ = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, svc_fn)
        .await;
}

//! corsrelay - forward relay that adds CORS headers to proxied responses.
//!
//! The relay accepts plain HTTP on its listening port, resolves the real
//! target from the request path or query string, fetches it over HTTP or
//! HTTPS and streams the answer back with the CORS headers browsers need
//! for cross-origin reads.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use prometheus_client::registry::Registry;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::{error, info, warn};

use corsrelay::admin::AdminServer;
use corsrelay::error::RelayError;
use corsrelay::lifecycle::{DrainResult, LifecycleConfig, LifecycleManager};
use corsrelay::logging_layer::logging_layer;
use corsrelay::metrics::RelayMetrics;
use corsrelay::ports::{admin_port, relay_port};
use corsrelay::rate_limiter::ClientRateLimiter;
use corsrelay::relay_config::RelayConfig;
use corsrelay::relay_service::RelayService;

const DRAINING_BODY: &str = "503 Service Unavailable\n\n\
    The relay is shutting down.\n\
    Retry your request against another instance.";

const SATURATED_BODY: &str = "503 Service Unavailable\n\n\
    The relay is at its concurrent connection limit.\n\
    Retry in a moment.";

const CONNECT_REJECT_BODY: &str = "405 Method Not Allowed\n\n\
    CONNECT tunnels are not supported; the relay fetches the target\n\
    on your behalf. Name the destination as /<url>, ?url=<url> or\n\
    ?download=<url> instead.";

/// Command line for the relay binary.
///
/// Ports come from `PORT` and `CORSRELAY_ADMIN_PORT`; every relay policy
/// knob from the `CORSRELAY_*` environment variables.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bind address for the relay and admin listeners
    #[arg(short, long, default_value = "0.0.0.0", env = "HOST")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _log_guard = init_tracing();

    let cli = Cli::parse();
    let config = Arc::new(RelayConfig::from_env());
    let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::from_env()));
    lifecycle.mark_config_loaded();

    let mut registry = Registry::default();
    let metrics = Arc::new(RelayMetrics::new(&mut registry));
    let registry = Arc::new(registry);

    // One token stops intake: the listener, the admin plane and the sweep
    // task. The stream token is separate and fires only after the drain, so
    // in-flight response bodies get the drain window to finish.
    let shutdown = CancellationToken::new();
    let stream_stop = CancellationToken::new();

    let limiter = Arc::new(ClientRateLimiter::new(
        config.rate_limit.clone(),
        Duration::from_secs(config.rate_limit_stale_secs),
    ));
    limiter.spawn_cleanup_task(shutdown.clone(), metrics.rate_limit_tracked_clients.clone());

    let relay = RelayService::new(
        config.clone(),
        limiter,
        metrics.clone(),
        stream_stop.clone(),
    )?;
    lifecycle.mark_client_ready();

    // Health and metrics stay on loopback, separate from relay policy.
    {
        let admin = AdminServer::new(lifecycle.clone(), registry.clone());
        let admin_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = admin.run(admin_shutdown).await {
                error!(error = %e, "Admin server failed");
            }
        });
    }

    let addr = format!("{}:{}", cli.bind, relay_port());
    let listener = TcpListener::bind(&addr).await?;
    lifecycle.mark_ready();

    info!(
        addr = %addr,
        admin_port = admin_port(),
        drain_timeout_secs = lifecycle.config().drain_timeout.as_secs(),
        rate_limited = config.rate_limit.is_some(),
        redirect_same_origin = config.redirect_same_origin,
        max_concurrent_connections = config.max_concurrent_connections,
        request_timeout_secs = config.request_timeout.as_secs(),
        "CORS relay accepting requests"
    );

    spawn_signal_watchers(shutdown.clone(), lifecycle.clone());

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_connections));
    let request_timeout = config.request_timeout;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                };

                // Refuse outright while draining.
                let Some(live_guard) = lifecycle.track_request() else {
                    warn!(peer = %peer_addr, "Connection refused, relay is draining");
                    tokio::spawn(async move {
                        let _ = write_plain_response(
                            stream,
                            "503 Service Unavailable",
                            Some(5),
                            DRAINING_BODY,
                        )
                        .await;
                    });
                    continue;
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    warn!(
                        peer = %peer_addr,
                        limit = config.max_concurrent_connections,
                        "Connection refused, concurrency limit reached"
                    );
                    drop(live_guard);
                    tokio::spawn(async move {
                        let _ = write_plain_response(
                            stream,
                            "503 Service Unavailable",
                            Some(1),
                            SATURATED_BODY,
                        )
                        .await;
                    });
                    continue;
                };

                if let Err(e) = tune_socket(&stream, &config) {
                    warn!(error = %e, "Socket tuning failed");
                }

                metrics.connections_active.inc();

                // The peer address keys the rate limiter when no origin
                // header exists, so the service is bound per connection.
                let stack = ServiceBuilder::new()
                    .layer(logging_layer())
                    .service(relay.bind(peer_addr));
                let conn_shutdown = shutdown.clone();
                let conn_metrics = metrics.clone();

                tokio::spawn(async move {
                    let served = tokio::time::timeout(
                        request_timeout,
                        serve_connection(stream, stack, conn_shutdown),
                    )
                    .await;
                    match served {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(error = %e, peer = %peer_addr, "Connection ended with error");
                        }
                        Err(_) => {
                            warn!(
                                peer = %peer_addr,
                                timeout_secs = request_timeout.as_secs(),
                                "Connection exceeded its time budget, dropping"
                            );
                        }
                    }

                    conn_metrics.connections_active.dec();
                    drop(live_guard);
                    drop(permit);
                });
            }

            _ = shutdown.cancelled() => {
                info!("Accept loop stopping");
                break;
            }
        }
    }

    info!(
        active_requests = lifecycle.active_request_count(),
        drain_timeout_secs = lifecycle.config().drain_timeout.as_secs(),
        "Draining in-flight requests"
    );
    let drained = lifecycle.drain_requests().await;

    // Response streams still running past the drain window end now.
    stream_stop.cancel();
    lifecycle.mark_stopped();

    match drained {
        DrainResult::Complete => {
            info!("Drained cleanly, exiting");
            Ok(())
        }
        DrainResult::Timeout { remaining } => {
            Err(format!("{remaining} requests still active after the drain window").into())
        }
    }
}

/// JSON logs on stdout through a non-blocking writer. The returned guard
/// must live until exit so buffered lines are flushed.
fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .json()
        .with_writer(writer)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    guard
}

/// Install the shutdown signal tasks.
///
/// SIGINT and SIGTERM begin a graceful drain. SIGQUIT skips the drain and
/// exits immediately with a nonzero status.
fn spawn_signal_watchers(shutdown: CancellationToken, lifecycle: Arc<LifecycleManager>) {
    {
        let shutdown = shutdown.clone();
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            let signal = wait_for_shutdown_signal().await;
            info!(signal, "Shutdown signal received, beginning drain");
            lifecycle.begin_shutdown();
            shutdown.cancel();
        });
    }

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let Ok(mut sigquit) = signal(SignalKind::quit()) else {
            error!("Cannot install SIGQUIT handler");
            return;
        };
        sigquit.recv().await;
        warn!(
            active_requests = lifecycle.active_request_count(),
            "SIGQUIT received, exiting without drain"
        );
        lifecycle.mark_stopped();
        // This runs in a spawned task and cannot return through main().
        std::process::exit(1);
    });

    #[cfg(not(unix))]
    drop(lifecycle);
}

/// Resolve on SIGINT or SIGTERM, whichever lands first.
async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                error!(error = %e, "Cannot install SIGTERM handler, listening for SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl_c"
    }
}

/// Serve one accepted connection with hyper's auto (HTTP/1 + HTTP/2) builder.
///
/// CONNECT is rejected before hyper parses anything: a relay that fetches
/// targets itself must never become a blind tunnel.
async fn serve_connection<S, B>(
    stream: TcpStream,
    service: S,
    shutdown: CancellationToken,
) -> Result<(), RelayError>
where
    S: tower::Service<Request<Incoming>, Response = Response<B>, Error = RelayError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: http_body::Body<Data = bytes::Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if connect_preamble(&stream).await {
        warn!("CONNECT rejected, the relay terminates requests itself");
        let _ = write_plain_response(stream, "405 Method Not Allowed", None, CONNECT_REJECT_BODY)
            .await;
        return Ok(());
    }

    let svc_fn = hyper::service::service_fn(move |req| {
        let mut svc = service.clone();
        async move {
            let response = match svc.call(req).await {
                Ok(response) => response.map(|body| {
                    body.map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.into() })
                        .boxed()
                }),
                Err(e) => {
                    // The service answers policy failures itself; landing
                    // here means there is still a status code to send.
                    error!(error = %e, "Request failed outside the response path");
                    e.to_response()
                        .map(|body| body.map_err(|e| match e {}).boxed())
                }
            };
            Ok::<_, std::convert::Infallible>(response)
        }
    });

    let io = TokioIo::new(stream);
    let builder = auto::Builder::new(hyper_util::rt::TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(io, svc_fn);
    tokio::pin!(conn);

    tokio::select! {
        served = &mut conn => {
            if let Err(e) = served {
                error!(error = %e, "Connection error");
            }
        }
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(Duration::from_secs(5), conn).await;
        }
    }

    Ok(())
}

/// True when the first bytes on the wire spell a CONNECT request.
async fn connect_preamble(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 7];
    matches!(stream.peek(&mut buf).await, Ok(n) if n >= 7 && &buf == b"CONNECT")
}

/// Apply the configured TCP options to an accepted socket.
fn tune_socket(stream: &TcpStream, config: &RelayConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    let sock = socket2::SockRef::from(stream);
    sock.set_tcp_keepalive(
        &socket2::TcpKeepalive::new().with_time(Duration::from_secs(config.tcp_keepalive_secs)),
    )?;
    sock.set_recv_buffer_size(config.socket_buffer_size)?;
    sock.set_send_buffer_size(config.socket_buffer_size)
}

/// Minimal HTTP/1.1 answer written straight to the socket, for connections
/// turned away before hyper ever sees them.
async fn write_plain_response(
    mut stream: TcpStream,
    status_line: &str,
    retry_after_secs: Option<u32>,
    body: &str,
) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let retry = match retry_after_secs {
        Some(secs) => format!("Retry-After: {secs}\r\n"),
        None => String::new(),
    };
    let response = format!(
        "HTTP/1.1 {status_line}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         {retry}\r\n\
         {body}",
        body.len()
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

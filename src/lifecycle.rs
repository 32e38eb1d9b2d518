//! Process lifecycle: startup gating, probes and graceful drain.
//!
//! The relay moves through four states (`Starting → Ready → ShuttingDown →
//! Stopped`). [`LifecycleManager`] owns the state plus the in-flight request
//! count, and the admin plane serves its two probes: `/health` answers as
//! long as the process is usable, `/ready` only once startup checks pass and
//! until shutdown begins. On shutdown the accept loop stops taking new work
//! and [`LifecycleManager::drain_requests`] waits out the stragglers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Phases the relay process moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Still wiring up listeners and the outbound client
    Starting,
    /// Serving requests
    Ready,
    /// Draining; new requests are refused
    ShuttingDown,
    /// Drain finished, process about to exit
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Shutdown timing knobs.
///
/// Environment variables: `CORSRELAY_SHUTDOWN_TIMEOUT_SECS` (default 30)
/// and `CORSRELAY_DRAIN_TIMEOUT_SECS` (default 25). The drain window is
/// clamped to fit inside the shutdown window, never rejected: a bad value
/// in either variable degrades to something workable with a warning.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Hard ceiling on the whole shutdown sequence
    pub shutdown_timeout: Duration,
    /// How long `drain_requests` waits for in-flight work
    pub drain_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(25),
        }
    }
}

impl LifecycleConfig {
    /// Read both knobs from the environment, clamping the drain window.
    #[must_use]
    pub fn from_env() -> Self {
        let default = Self::default();
        let shutdown_timeout =
            parse_duration_env("CORSRELAY_SHUTDOWN_TIMEOUT_SECS", default.shutdown_timeout);
        let drain_timeout =
            parse_duration_env("CORSRELAY_DRAIN_TIMEOUT_SECS", default.drain_timeout);

        Self {
            shutdown_timeout,
            drain_timeout: clamp_drain(drain_timeout, shutdown_timeout),
        }
    }
}

/// The drain window must leave a second of the shutdown window for
/// post-drain cleanup, and can never drop below one second itself.
fn clamp_drain(drain: Duration, shutdown: Duration) -> Duration {
    const FLOOR: Duration = Duration::from_secs(1);
    let ceiling = Duration::from_secs(shutdown.as_secs().saturating_sub(1)).max(FLOOR);

    if drain >= shutdown {
        let scaled = Duration::from_secs(shutdown.as_secs() * 4 / 5).clamp(FLOOR, ceiling);
        warn!(
            drain_secs = drain.as_secs(),
            shutdown_secs = shutdown.as_secs(),
            using_secs = scaled.as_secs(),
            "Drain window does not fit inside the shutdown window, scaling down"
        );
        scaled
    } else if drain > ceiling {
        warn!(
            drain_secs = drain.as_secs(),
            using_secs = ceiling.as_secs(),
            "Drain window leaves no cleanup buffer, clamping"
        );
        ceiling
    } else if drain < FLOOR {
        warn!(
            drain_secs = drain.as_secs(),
            "Drain window below one second, raising"
        );
        FLOOR
    } else {
        drain
    }
}

fn parse_duration_env(var_name: &str, default: Duration) -> Duration {
    match std::env::var(var_name) {
        Ok(value) => match value.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                warn!(
                    var = var_name,
                    value = %value,
                    default_secs = default.as_secs(),
                    "Unparseable duration in environment, keeping default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// Shared coordinator for state, request counting and shutdown.
///
/// One instance lives behind an `Arc` for the whole process. Everything on
/// it is atomic or lock-free; the accept loop, the admin handlers and the
/// signal task all touch it concurrently.
pub struct LifecycleManager {
    state: ArcSwap<LifecycleState>,
    started_at: Instant,
    shutdown_token: CancellationToken,
    active_requests: AtomicUsize,
    /// Startup check: relay configuration parsed
    config_loaded: AtomicBool,
    /// Startup check: outbound HTTPS client built
    client_ready: AtomicBool,
    config: LifecycleConfig,
    version: &'static str,
}

impl LifecycleManager {
    /// New manager in `Starting`, with its own shutdown token.
    #[must_use]
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            state: ArcSwap::new(Arc::new(LifecycleState::Starting)),
            started_at: Instant::now(),
            shutdown_token: CancellationToken::new(),
            active_requests: AtomicUsize::new(0),
            config_loaded: AtomicBool::new(false),
            client_ready: AtomicBool::new(false),
            config,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), LifecycleState::Ready)
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::ShuttingDown | LifecycleState::Stopped
        )
    }

    /// Flip to `Ready` and log the startup duration.
    pub fn mark_ready(&self) {
        self.state.store(Arc::new(LifecycleState::Ready));
        info!(
            version = %self.version,
            startup_ms = self.started_at.elapsed().as_millis(),
            "Relay ready"
        );
    }

    /// Record that relay configuration parsed cleanly.
    pub fn mark_config_loaded(&self) {
        self.config_loaded.store(true, Ordering::SeqCst);
    }

    /// Record that the outbound HTTPS client is built.
    pub fn mark_client_ready(&self) {
        self.client_ready.store(true, Ordering::SeqCst);
    }

    /// Token cancelled when shutdown begins; hand clones to background tasks.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Enter `ShuttingDown` and cancel the shutdown token.
    pub fn begin_shutdown(&self) {
        self.state.store(Arc::new(LifecycleState::ShuttingDown));
        self.shutdown_token.cancel();
        info!(
            active_requests = self.active_requests.load(Ordering::SeqCst),
            "Drain starting"
        );
    }

    /// Count a request in, or refuse it during shutdown.
    ///
    /// The guard counts the request back out on drop, panics included, so
    /// the drain can trust the counter.
    #[must_use]
    pub fn track_request(self: &Arc<Self>) -> Option<RequestGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        Some(RequestGuard {
            manager: Arc::clone(self),
        })
    }

    #[must_use]
    pub fn active_request_count(&self) -> usize {
        self.active_requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    #[must_use]
    pub fn version(&self) -> &'static str {
        self.version
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Snapshot of the startup checks.
    #[must_use]
    pub fn readiness_checks(&self) -> ReadinessChecks {
        ReadinessChecks {
            config_loaded: self.config_loaded.load(Ordering::SeqCst),
            client_ready: self.client_ready.load(Ordering::SeqCst),
        }
    }

    /// Wait for in-flight requests, up to the drain window.
    ///
    /// Polls the counter on a 100ms cadence and reports progress every five
    /// seconds, so a slow drain is visible in the logs rather than silent.
    pub async fn drain_requests(&self) -> DrainResult {
        let started = Instant::now();
        let mut announced = Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_millis(100));

        loop {
            let remaining = self.active_requests.load(Ordering::SeqCst);
            if remaining == 0 {
                return DrainResult::Complete;
            }
            if started.elapsed() > self.config.drain_timeout {
                warn!(remaining, "Requests still active at the end of the drain window");
                return DrainResult::Timeout { remaining };
            }
            if announced.elapsed() >= Duration::from_secs(5) {
                info!(remaining, "Waiting for in-flight requests");
                announced = Instant::now();
            }
            ticker.tick().await;
        }
    }

    /// Final state before exit.
    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(LifecycleState::Stopped));
    }
}

/// Live-request token from [`LifecycleManager::track_request`].
///
/// Holds its manager by `Arc` so it can ride along into spawned tasks.
pub struct RequestGuard {
    manager: Arc<LifecycleManager>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.manager.active_requests.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Outcome of a drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    /// Every request finished inside the window
    Complete,
    /// Window expired with requests still running
    Timeout { remaining: usize },
}

/// Body of a 200 `/health` answer.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
}

/// Body of a 503 `/health` answer.
#[derive(Debug, Serialize)]
pub struct UnhealthyResponse {
    pub status: &'static str,
    pub reason: String,
}

/// Startup check results, serialized into `/ready` answers.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessChecks {
    pub config_loaded: bool,
    pub client_ready: bool,
}

impl ReadinessChecks {
    #[must_use]
    pub fn all_pass(&self) -> bool {
        self.config_loaded && self.client_ready
    }

    /// Name of the first failing check, for the probe's `reason` field.
    #[must_use]
    pub fn first_failure(&self) -> Option<&'static str> {
        if !self.config_loaded {
            Some("config_loaded")
        } else if !self.client_ready {
            Some("client_ready")
        } else {
            None
        }
    }
}

/// Body of a `/ready` answer, either status.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub checks: ReadinessChecks,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Router serving `GET /health` and `GET /ready`.
pub fn health_router(lifecycle: Arc<LifecycleManager>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(readiness_handler))
        .with_state(lifecycle)
}

/// Liveness: 200 until the process reaches `Stopped`.
async fn health_handler(State(lifecycle): State<Arc<LifecycleManager>>) -> Response {
    match lifecycle.state() {
        LifecycleState::Stopped => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(UnhealthyResponse {
                status: "unhealthy",
                reason: "relay_stopped".to_string(),
            }),
        )
            .into_response(),
        _ => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                version: lifecycle.version(),
                uptime_seconds: lifecycle.uptime_seconds(),
            }),
        )
            .into_response(),
    }
}

/// Readiness: 200 only in `Ready` with all startup checks green. The 503
/// body names whatever is blocking, in precedence order.
async fn readiness_handler(State(lifecycle): State<Arc<LifecycleManager>>) -> Response {
    let checks = lifecycle.readiness_checks();

    let blocker = if lifecycle.is_shutting_down() {
        Some("shutting_down".to_string())
    } else if let Some(check) = checks.first_failure() {
        Some(check.to_string())
    } else if !lifecycle.is_ready() {
        Some(format!("state: {}", lifecycle.state()))
    } else {
        None
    };

    match blocker {
        None => (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                checks,
                reason: None,
            }),
        )
            .into_response(),
        Some(reason) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "not_ready",
                checks,
                reason: Some(reason),
            }),
        )
            .into_response(),
    }
}

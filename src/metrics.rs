//! Prometheus metrics for the relay.
//!
//! All metric names use the `corsrelay_` prefix. A single [`RelayMetrics`]
//! is created at startup against the registry served by the admin endpoint;
//! the pieces that live on hot paths (the bytes counter handed to response
//! bodies, the gauges handed to the accept loop and the rate-limiter sweep)
//! are cheap clones of the registered handles.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Labels for request outcome counts.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// Final disposition of the request (e.g. "relayed", "access_denied")
    pub outcome: String,
}

/// Labels for upstream call durations.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SchemeLabels {
    /// Target scheme: "http" or "https"
    pub scheme: String,
}

/// Histogram buckets for upstream fetch latency, in milliseconds.
const UPSTREAM_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 10000.0,
];

/// Request outcomes as recorded by the dispatcher.
///
/// One outcome is recorded per inbound request, after the pipeline settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Forwarded upstream and the response was handed back
    Relayed,
    /// Answered with the same-origin redirect shortcut
    Redirected,
    /// Answered directly as a CORS preflight
    Preflight,
    /// Rejected by the access filter
    AccessDenied,
    /// Rejected by the rate limiter
    RateLimited,
    /// No usable target could be resolved
    InvalidTarget,
    /// Upstream connect or response failure
    GatewayError,
}

impl RequestOutcome {
    fn as_str(self) -> &'static str {
        match self {
            RequestOutcome::Relayed => "relayed",
            RequestOutcome::Redirected => "redirected",
            RequestOutcome::Preflight => "preflight",
            RequestOutcome::AccessDenied => "access_denied",
            RequestOutcome::RateLimited => "rate_limited",
            RequestOutcome::InvalidTarget => "invalid_target",
            RequestOutcome::GatewayError => "gateway_error",
        }
    }
}

/// Metrics registered by the relay.
pub struct RelayMetrics {
    /// Inbound requests by final outcome.
    pub requests_total: Family<OutcomeLabels, Counter>,

    /// Upstream call latency in milliseconds, by target scheme.
    pub upstream_duration_ms: Family<SchemeLabels, Histogram>,

    /// Response bytes streamed back to clients.
    pub bytes_relayed_total: Counter,

    /// Currently open client connections.
    pub connections_active: Gauge,

    /// Client keys currently tracked by the rate limiter.
    pub rate_limit_tracked_clients: Gauge,
}

impl RelayMetrics {
    /// Build the metric families and register them under the relay prefix.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "corsrelay_requests_total",
            "Inbound requests by final outcome",
            requests_total.clone(),
        );

        let upstream_duration_ms = Family::<SchemeLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(UPSTREAM_BUCKETS.iter().copied())
        });
        registry.register(
            "corsrelay_upstream_duration_ms",
            "Upstream call latency in milliseconds by target scheme",
            upstream_duration_ms.clone(),
        );

        let bytes_relayed_total = Counter::default();
        registry.register(
            "corsrelay_bytes_relayed_total",
            "Response bytes streamed back to clients",
            bytes_relayed_total.clone(),
        );

        let connections_active = Gauge::default();
        registry.register(
            "corsrelay_connections_active",
            "Currently open client connections",
            connections_active.clone(),
        );

        let rate_limit_tracked_clients = Gauge::default();
        registry.register(
            "corsrelay_rate_limit_tracked_clients",
            "Client keys currently tracked by the rate limiter",
            rate_limit_tracked_clients.clone(),
        );

        Self {
            requests_total,
            upstream_duration_ms,
            bytes_relayed_total,
            connections_active,
            rate_limit_tracked_clients,
        }
    }

    /// Record a settled request.
    pub fn record_outcome(&self, outcome: RequestOutcome) {
        self.requests_total
            .get_or_create(&OutcomeLabels {
                outcome: outcome.as_str().to_string(),
            })
            .inc();
    }

    /// Record an upstream call's latency.
    pub fn record_upstream_duration(&self, scheme: &str, millis: f64) {
        self.upstream_duration_ms
            .get_or_create(&SchemeLabels {
                scheme: scheme.to_string(),
            })
            .observe(millis);
    }
}

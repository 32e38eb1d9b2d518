//! Centralized configuration for the relay.
//!
//! Relay behavior (origin lists, removed headers, forced response headers,
//! rate limiting) and transport tunables (timeouts, TCP settings, pool
//! sizing) all resolve here, from defaults or environment variables. The
//! resulting struct is built once at startup and shared read-only.

use std::time::Duration;

use tracing::warn;

use crate::rate_limiter::RateLimitPolicy;

/// Request headers stripped from every outbound request. Cookies never
/// belong on a third-party fetch, and the rest are fronting-proxy debug
/// headers the original deployment scrubbed.
pub const DEFAULT_REMOVE_HEADERS: &[&str] = &[
    "cookie",
    "cookie2",
    "x-request-start",
    "x-request-id",
    "via",
    "connect-time",
    "total-route-time",
];

/// Runtime configuration, immutable after startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Origins denied outright
    pub origin_blacklist: Vec<String>,
    /// When non-empty, only these origins are served
    pub origin_whitelist: Vec<String>,
    /// Request headers that must be present on every request
    pub required_headers: Vec<String>,
    /// Request headers stripped before forwarding
    pub remove_headers: Vec<String>,
    /// Response header overrides applied to every response
    pub set_response_headers: Vec<(String, String)>,
    /// Redirect instead of relaying when the target matches the caller's origin
    pub redirect_same_origin: bool,
    /// Per-client quota; `None` disables limiting
    pub rate_limit: Option<RateLimitPolicy>,
    /// Idle horizon before rate-limit windows are swept
    pub rate_limit_stale_secs: u64,

    /// Deadline for the outbound request head (connect through first byte)
    pub outbound_timeout: Duration,
    /// Per-chunk deadline while streaming the response body
    pub stream_chunk_timeout: Duration,
    /// Whole-stream deadline for the response body
    pub stream_total_timeout: Duration,
    /// Wall-clock budget for one inbound connection
    pub request_timeout: Duration,
    /// Concurrent inbound connection cap
    pub max_concurrent_connections: usize,
    /// Enable TCP_NODELAY on accepted sockets
    pub tcp_nodelay: bool,
    /// Keepalive probe interval for accepted sockets, in seconds
    pub tcp_keepalive_secs: u64,
    /// SO_RCVBUF / SO_SNDBUF applied to accepted sockets
    pub socket_buffer_size: usize,
    /// Max idle outbound connections kept per target host
    pub pool_max_idle_per_host: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            origin_blacklist: Vec::new(),
            origin_whitelist: Vec::new(),
            required_headers: Vec::new(),
            remove_headers: DEFAULT_REMOVE_HEADERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            set_response_headers: vec![(
                "access-control-allow-origin".to_string(),
                "*".to_string(),
            )],
            redirect_same_origin: true,
            rate_limit: None,
            rate_limit_stale_secs: 600,

            outbound_timeout: Duration::from_secs(30),
            stream_chunk_timeout: Duration::from_secs(300),
            stream_total_timeout: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(300),
            max_concurrent_connections: 10000,
            tcp_nodelay: true,
            tcp_keepalive_secs: 60,
            socket_buffer_size: 262144, // 256 KB
            pool_max_idle_per_host: 128,
        }
    }
}

impl RelayConfig {
    /// Read every knob from its `CORSRELAY_*` variable, defaulting the rest.
    ///
    /// # Environment Variables (relay behavior)
    ///
    /// - `CORSRELAY_BLACKLIST` / `CORSRELAY_WHITELIST` (comma-separated
    ///   origins, empty when unset)
    /// - `CORSRELAY_REQUIRED_HEADERS` (comma-separated header names)
    /// - `CORSRELAY_REMOVE_HEADERS` (comma-separated, replaces the default
    ///   strip list)
    /// - `CORSRELAY_REDIRECT_SAME_ORIGIN` (default: true)
    /// - `CORSRELAY_RATELIMIT` (descriptor, see [`RateLimitPolicy`])
    /// - `CORSRELAY_RATELIMIT_STALE_SECS` (default: 600)
    ///
    /// # Environment Variables (transport)
    ///
    /// - `CORSRELAY_OUTBOUND_TIMEOUT_SECS` (default: 30)
    /// - `CORSRELAY_STREAM_CHUNK_TIMEOUT_SECS` (default: 300)
    /// - `CORSRELAY_STREAM_TOTAL_TIMEOUT_SECS` (default: 3600)
    /// - `CORSRELAY_REQUEST_TIMEOUT_SECS` (default: 300)
    /// - `CORSRELAY_MAX_CONCURRENT_CONNECTIONS` (default: 10000)
    /// - `CORSRELAY_TCP_NODELAY` (default: true)
    /// - `CORSRELAY_TCP_KEEPALIVE_SECS` (default: 60)
    /// - `CORSRELAY_SOCKET_BUFFER_SIZE` (default: 262144)
    /// - `CORSRELAY_POOL_MAX_IDLE` (default: 128)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            origin_blacklist: parse_env_list("CORSRELAY_BLACKLIST")
                .unwrap_or(default.origin_blacklist),

            origin_whitelist: parse_env_list("CORSRELAY_WHITELIST")
                .unwrap_or(default.origin_whitelist),

            required_headers: parse_env_list("CORSRELAY_REQUIRED_HEADERS")
                .unwrap_or(default.required_headers),

            remove_headers: parse_env_list("CORSRELAY_REMOVE_HEADERS")
                .unwrap_or(default.remove_headers),

            set_response_headers: default.set_response_headers,

            redirect_same_origin: parse_env_warn(
                "CORSRELAY_REDIRECT_SAME_ORIGIN",
                default.redirect_same_origin,
            ),

            rate_limit: RateLimitPolicy::from_env(),

            rate_limit_stale_secs: parse_env_warn(
                "CORSRELAY_RATELIMIT_STALE_SECS",
                default.rate_limit_stale_secs,
            ),

            outbound_timeout: Duration::from_secs(parse_env_warn(
                "CORSRELAY_OUTBOUND_TIMEOUT_SECS",
                default.outbound_timeout.as_secs(),
            )),

            stream_chunk_timeout: Duration::from_secs(parse_env_warn(
                "CORSRELAY_STREAM_CHUNK_TIMEOUT_SECS",
                default.stream_chunk_timeout.as_secs(),
            )),

            stream_total_timeout: Duration::from_secs(parse_env_warn(
                "CORSRELAY_STREAM_TOTAL_TIMEOUT_SECS",
                default.stream_total_timeout.as_secs(),
            )),

            request_timeout: Duration::from_secs(parse_env_warn(
                "CORSRELAY_REQUEST_TIMEOUT_SECS",
                default.request_timeout.as_secs(),
            )),

            max_concurrent_connections: parse_env_warn(
                "CORSRELAY_MAX_CONCURRENT_CONNECTIONS",
                default.max_concurrent_connections,
            ),

            tcp_nodelay: parse_env_warn("CORSRELAY_TCP_NODELAY", default.tcp_nodelay),

            tcp_keepalive_secs: parse_env_warn(
                "CORSRELAY_TCP_KEEPALIVE_SECS",
                default.tcp_keepalive_secs,
            ),

            socket_buffer_size: parse_env_warn(
                "CORSRELAY_SOCKET_BUFFER_SIZE",
                default.socket_buffer_size,
            ),

            pool_max_idle_per_host: parse_env_warn(
                "CORSRELAY_POOL_MAX_IDLE",
                default.pool_max_idle_per_host,
            ),
        }
    }
}

/// FromStr through an env var, warning instead of failing on bad input.
///
/// A set-but-unparseable value logs once and yields the default; an unset
/// variable yields the default silently.
pub(crate) fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(
    name: &str,
    default: T,
) -> T {
    match std::env::var(name) {
        Ok(val) => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Unparseable value in environment, keeping default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse a comma-separated environment list. `None` when the variable is
/// unset; empty entries are dropped.
fn parse_env_list(name: &str) -> Option<Vec<String>> {
    let raw = std::env::var(name).ok()?;
    Some(
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
    )
}

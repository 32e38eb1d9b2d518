//! Per-client rate limiting for relayed requests.
//!
//! Clients are keyed by origin host (falling back to remote IP upstream of
//! this module). Each key gets a fixed counting window; the first request in
//! a window resets the count, later ones increment it until the quota is
//! reached. The `DashMap` entry guard holds the key's shard exclusively for
//! the whole check-and-increment, so two requests racing at the quota
//! boundary can never both slip through.
//!
//! Entries are never removed on the request path. A background sweep evicts
//! keys that have been idle past the staleness horizon, which bounds memory
//! under client churn.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use prometheus_client::metrics::gauge::Gauge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default idle horizon before a client's window is swept.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(600);

/// Quota configuration parsed from the compact descriptor
/// `"<max> <N>/<unit> [exempt1,exempt2]"`, e.g. `"100 10/minute"` for 100
/// requests per 10 minutes or `"50 1/hour internal.example"` with an exempt
/// host list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Requests allowed per window
    pub max_requests: u32,
    /// Window length
    pub window: Duration,
    /// Client keys that bypass the quota entirely (host form, normalized)
    pub exempt_origins: HashSet<String>,
}

impl RateLimitPolicy {
    /// Parse a descriptor string.
    pub fn parse(descriptor: &str) -> Result<Self, String> {
        let mut tokens = descriptor.split_whitespace();

        let max_requests: u32 = tokens
            .next()
            .ok_or("missing request count")?
            .parse()
            .map_err(|_| "request count is not a number".to_string())?;
        if max_requests == 0 {
            return Err("request count must be at least 1".to_string());
        }

        let window_token = tokens.next().ok_or("missing window, expected <N>/<unit>")?;
        let (magnitude, unit) = window_token
            .split_once('/')
            .ok_or("window must be <N>/<unit>")?;
        let magnitude: u64 = magnitude
            .parse()
            .map_err(|_| "window magnitude is not a number".to_string())?;
        if magnitude == 0 {
            return Err("window magnitude must be at least 1".to_string());
        }
        let unit_secs = match unit {
            "second" | "seconds" => 1,
            "minute" | "minutes" => 60,
            "hour" | "hours" => 3600,
            other => return Err(format!("unknown window unit: {other}")),
        };

        let exempt_origins = tokens
            .flat_map(|t| t.split(','))
            .map(crate::access_control::origin_host)
            .filter(|h| !h.is_empty())
            .collect();

        Ok(Self {
            max_requests,
            window: Duration::from_secs(magnitude * unit_secs),
            exempt_origins,
        })
    }

    /// Read the policy from `CORSRELAY_RATELIMIT`.
    ///
    /// Unset or blank means unlimited. A malformed descriptor logs a warning
    /// and disables limiting instead of failing startup.
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var("CORSRELAY_RATELIMIT").ok()?;
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match Self::parse(raw) {
            Ok(policy) => Some(policy),
            Err(reason) => {
                warn!(
                    descriptor = %raw,
                    reason = %reason,
                    "Invalid rate-limit descriptor, limiting disabled"
                );
                None
            }
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Under quota (or limiting disabled / client exempt)
    Allowed,
    /// Over quota; `retry_after_secs` is the remaining window, rounded up
    Limited { retry_after_secs: u64 },
}

#[derive(Debug)]
struct ClientWindow {
    count: u32,
    window_start: Instant,
    last_seen: Instant,
}

/// Shared fixed-window limiter, injected into the dispatcher.
#[derive(Debug)]
pub struct ClientRateLimiter {
    policy: Option<RateLimitPolicy>,
    windows: DashMap<String, ClientWindow>,
    stale_after: Duration,
}

impl ClientRateLimiter {
    /// Create a limiter. `policy: None` disables limiting; every check
    /// returns `Allowed` and no state is kept.
    ///
    /// The staleness horizon is clamped to at least the window length so the
    /// sweep can never forget a count that is still inside its window.
    pub fn new(policy: Option<RateLimitPolicy>, stale_after: Duration) -> Self {
        let stale_after = match &policy {
            Some(p) => stale_after.max(p.window),
            None => stale_after,
        };
        Self {
            policy,
            windows: DashMap::new(),
            stale_after,
        }
    }

    /// Check and count one request for `client_key`.
    pub fn check(&self, client_key: &str) -> RateLimitDecision {
        let Some(policy) = &self.policy else {
            return RateLimitDecision::Allowed;
        };

        if policy.exempt_origins.contains(client_key) {
            return RateLimitDecision::Allowed;
        }

        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(client_key.to_string())
            .or_insert_with(|| ClientWindow {
                count: 0,
                window_start: now,
                last_seen: now,
            });
        entry.last_seen = now;

        let elapsed = now.duration_since(entry.window_start);
        if elapsed >= policy.window {
            entry.count = 1;
            entry.window_start = now;
            return RateLimitDecision::Allowed;
        }

        if entry.count < policy.max_requests {
            entry.count += 1;
            RateLimitDecision::Allowed
        } else {
            let remaining = policy.window - elapsed;
            RateLimitDecision::Limited {
                retry_after_secs: (remaining.as_millis() as u64).div_ceil(1000).max(1),
            }
        }
    }

    /// Number of client keys currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    /// Evict windows idle past the staleness horizon.
    pub fn cleanup_stale(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.stale_after) else {
            return;
        };
        let before = self.windows.len();
        self.windows.retain(|_, w| w.last_seen > cutoff);
        let evicted = before - self.windows.len();
        if evicted > 0 {
            debug!(
                evicted,
                tracked = self.windows.len(),
                "Swept stale rate-limit windows"
            );
        }
    }

    /// Spawn the background sweep. Runs every half staleness horizon until
    /// `shutdown` fires, publishing the tracked-client count after each pass.
    pub fn spawn_cleanup_task(self: &Arc<Self>, shutdown: CancellationToken, tracked: Gauge) {
        let limiter = Arc::clone(self);
        let period = (self.stale_after / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick fires immediately; skip it so the initial sweep
            // happens one full period after startup.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        limiter.cleanup_stale();
                        tracked.set(limiter.tracked_clients() as i64);
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn policy(max_requests: u32, window: Duration) -> RateLimitPolicy {
        RateLimitPolicy {
            max_requests,
            window,
            exempt_origins: HashSet::new(),
        }
    }

    fn limiter(max_requests: u32, window: Duration) -> ClientRateLimiter {
        ClientRateLimiter::new(Some(policy(max_requests, window)), DEFAULT_STALE_AFTER)
    }

    /// Test: full descriptor round-trips into the policy fields
    #[test]
    fn parse_full_descriptor() {
        let policy = RateLimitPolicy::parse("100 10/minute example.com,https://other.example").unwrap();
        assert_eq!(policy.max_requests, 100);
        assert_eq!(policy.window, Duration::from_secs(600));
        assert!(policy.exempt_origins.contains("example.com"));
        assert!(policy.exempt_origins.contains("other.example"));
    }

    /// Test: all window units convert to seconds
    #[test]
    fn parse_window_units() {
        assert_eq!(
            RateLimitPolicy::parse("1 30/second").unwrap().window,
            Duration::from_secs(30)
        );
        assert_eq!(
            RateLimitPolicy::parse("1 2/minutes").unwrap().window,
            Duration::from_secs(120)
        );
        assert_eq!(
            RateLimitPolicy::parse("1 1/hour").unwrap().window,
            Duration::from_secs(3600)
        );
    }

    /// Test: malformed descriptors are rejected with a reason
    #[test]
    fn parse_rejects_malformed_descriptors() {
        assert!(RateLimitPolicy::parse("").is_err());
        assert!(RateLimitPolicy::parse("abc 1/minute").is_err());
        assert!(RateLimitPolicy::parse("10").is_err());
        assert!(RateLimitPolicy::parse("10 minute").is_err());
        assert!(RateLimitPolicy::parse("10 1/fortnight").is_err());
        assert!(RateLimitPolicy::parse("0 1/minute").is_err());
        assert!(RateLimitPolicy::parse("10 0/minute").is_err());
    }

    /// Test: no policy → every check allowed, nothing tracked
    #[test]
    fn disabled_limiter_always_allows() {
        let limiter = ClientRateLimiter::new(None, DEFAULT_STALE_AFTER);
        for _ in 0..1000 {
            assert_eq!(limiter.check("anyone"), RateLimitDecision::Allowed);
        }
        assert_eq!(limiter.tracked_clients(), 0);
    }

    /// Test: exactly max_requests calls allowed, the next one limited
    #[test]
    fn quota_boundary_is_exact() {
        let limiter = limiter(5, Duration::from_secs(60));
        for _ in 0..5 {
            assert_eq!(limiter.check("client"), RateLimitDecision::Allowed);
        }
        assert!(matches!(
            limiter.check("client"),
            RateLimitDecision::Limited { .. }
        ));
    }

    /// Test: retry_after reports the remaining window, at least 1s
    #[test]
    fn limited_reports_remaining_window() {
        let limiter = limiter(1, Duration::from_secs(60));
        assert_eq!(limiter.check("client"), RateLimitDecision::Allowed);
        match limiter.check("client") {
            RateLimitDecision::Limited { retry_after_secs } => {
                assert!(retry_after_secs >= 1);
                assert!(retry_after_secs <= 60);
            }
            RateLimitDecision::Allowed => panic!("expected Limited"),
        }
    }

    /// Test: an elapsed window resets the count
    #[test]
    fn window_elapse_resets_count() {
        let limiter = limiter(1, Duration::from_millis(50));
        assert_eq!(limiter.check("client"), RateLimitDecision::Allowed);
        assert!(matches!(
            limiter.check("client"),
            RateLimitDecision::Limited { .. }
        ));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(limiter.check("client"), RateLimitDecision::Allowed);
    }

    /// Test: different keys count independently
    #[test]
    fn keys_are_independent() {
        let limiter = limiter(1, Duration::from_secs(60));
        assert_eq!(limiter.check("a.example"), RateLimitDecision::Allowed);
        assert_eq!(limiter.check("b.example"), RateLimitDecision::Allowed);
        assert!(matches!(
            limiter.check("a.example"),
            RateLimitDecision::Limited { .. }
        ));
        assert_eq!(limiter.tracked_clients(), 2);
    }

    /// Test: exempt keys bypass the quota and leave no state behind
    #[test]
    fn exempt_keys_bypass_without_state() {
        let mut p = policy(1, Duration::from_secs(60));
        p.exempt_origins.insert("trusted.example".to_string());
        let limiter = ClientRateLimiter::new(Some(p), DEFAULT_STALE_AFTER);

        for _ in 0..10 {
            assert_eq!(limiter.check("trusted.example"), RateLimitDecision::Allowed);
        }
        assert_eq!(limiter.tracked_clients(), 0);
    }

    /// Test: concurrent checks at the quota boundary never overshoot
    #[test]
    fn concurrent_checks_never_overshoot() {
        let limiter = Arc::new(limiter(10, Duration::from_secs(60)));
        let barrier = Arc::new(Barrier::new(20));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    limiter.check("contended") == RateLimitDecision::Allowed
                })
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .filter(|&allowed| allowed)
            .count();
        assert_eq!(allowed, 10);
    }

    /// Test: sweep evicts idle windows
    #[test]
    fn cleanup_evicts_stale_windows() {
        let limiter = ClientRateLimiter::new(
            Some(policy(10, Duration::from_millis(1))),
            Duration::from_millis(1),
        );
        limiter.check("idle.example");
        assert_eq!(limiter.tracked_clients(), 1);

        std::thread::sleep(Duration::from_millis(5));
        limiter.cleanup_stale();
        assert_eq!(limiter.tracked_clients(), 0);
    }

    /// Test: sweep keeps recently active windows
    #[test]
    fn cleanup_retains_active_windows() {
        let limiter = limiter(10, Duration::from_secs(60));
        limiter.check("active.example");
        limiter.cleanup_stale();
        assert_eq!(limiter.tracked_clients(), 1);
    }

    /// Test: horizon is clamped so sweeps never outrun the window
    #[test]
    fn stale_horizon_covers_window() {
        let limiter = ClientRateLimiter::new(
            Some(policy(1, Duration::from_secs(3600))),
            Duration::from_secs(1),
        );
        assert_eq!(limiter.stale_after, Duration::from_secs(3600));
    }

    /// Test: CORSRELAY_RATELIMIT drives from_env
    #[test]
    #[serial_test::serial]
    fn from_env_parses_descriptor() {
        unsafe {
            std::env::set_var("CORSRELAY_RATELIMIT", "10 1/minute");
        }
        let policy = RateLimitPolicy::from_env().expect("policy should parse");
        assert_eq!(policy.max_requests, 10);
        assert_eq!(policy.window, Duration::from_secs(60));

        unsafe {
            std::env::set_var("CORSRELAY_RATELIMIT", "not a descriptor");
        }
        assert_eq!(RateLimitPolicy::from_env(), None);

        unsafe {
            std::env::remove_var("CORSRELAY_RATELIMIT");
        }
        assert_eq!(RateLimitPolicy::from_env(), None);
    }
}

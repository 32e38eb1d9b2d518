//! Origin-based access control for inbound requests.
//!
//! Evaluation order: blacklist first, then whitelist membership when a
//! whitelist is configured, then required request headers. A missing
//! required header denies even an otherwise acceptable origin.

use std::collections::HashSet;

use http::HeaderMap;

/// Outcome of evaluating an inbound request against the configured rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// Request may proceed to the rate limiter
    Allow,
    /// Request is rejected; `reason` becomes the response body
    Deny { reason: String },
}

/// Immutable origin filter, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    blacklist: HashSet<String>,
    whitelist: HashSet<String>,
    required_headers: Vec<String>,
}

impl AccessControl {
    /// Build a filter from raw origin lists and required header names.
    ///
    /// List entries and header names are normalized here so `evaluate` only
    /// normalizes the inbound side.
    pub fn new<I, J, K>(blacklist: I, whitelist: J, required_headers: K) -> Self
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = String>,
        K: IntoIterator<Item = String>,
    {
        Self {
            blacklist: blacklist.into_iter().map(|o| normalize_origin(&o)).collect(),
            whitelist: whitelist.into_iter().map(|o| normalize_origin(&o)).collect(),
            required_headers: required_headers
                .into_iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    /// Evaluate an inbound request.
    ///
    /// `origin` is the raw `origin` header value when present. Requests
    /// without one evaluate with an empty origin, which a non-empty
    /// whitelist rejects.
    pub fn evaluate(&self, origin: Option<&str>, headers: &HeaderMap) -> AccessDecision {
        let origin = normalize_origin(origin.unwrap_or(""));

        if self.blacklist.contains(&origin) {
            return AccessDecision::Deny {
                reason: format!(
                    "The origin \"{origin}\" was blacklisted by the operator of this relay."
                ),
            };
        }

        if !self.whitelist.is_empty() && !self.whitelist.contains(&origin) {
            return AccessDecision::Deny {
                reason: format!(
                    "The origin \"{origin}\" was not whitelisted by the operator of this relay."
                ),
            };
        }

        for name in &self.required_headers {
            if !headers.contains_key(name.as_str()) {
                return AccessDecision::Deny {
                    reason: format!("Missing required request header: {name}"),
                };
            }
        }

        AccessDecision::Allow
    }
}

/// Normalize an origin for comparison: trimmed, lowercased, no trailing `/`.
pub fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Reduce an origin to its host form for rate-limit keying: the scheme is
/// dropped so `https://app.example.com` and `http://app.example.com` share a
/// bucket.
pub fn origin_host(origin: &str) -> String {
    let normalized = normalize_origin(origin);
    match normalized.split_once("//") {
        Some((_, host)) => host.to_string(),
        None => normalized,
    }
}

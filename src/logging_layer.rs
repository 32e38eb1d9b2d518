//! Request and response logging built on `tower_http::trace::TraceLayer`.
//!
//! Every request span carries a correlation id, reused from `x-request-id`
//! when a front proxy already assigned one. Header dumps are debug-only and
//! go through a redaction wrapper first: credentials bound for a relayed
//! target must never reach the log stream.

use http::HeaderMap;
use std::fmt;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Header names whose values are never written to the log.
const REDACTED_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "x-api-key",
    "x-auth-token",
    "proxy-authorization",
    "set-cookie",
];

/// The relay's `TraceLayer` with its span maker and logging callbacks.
pub fn logging_layer() -> TraceLayer<
    tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>,
    RequestSpan,
    RequestLog,
    ResponseLog,
    tower_http::trace::DefaultOnBodyChunk,
    tower_http::trace::DefaultOnEos,
    FailureLog,
> {
    TraceLayer::new_for_http()
        .make_span_with(RequestSpan)
        .on_request(RequestLog)
        .on_response(ResponseLog)
        .on_failure(FailureLog)
}

/// Correlation id without per-request CSPRNG cost.
///
/// One `Uuid::new_v4()` at startup seeds the upper half; a relaxed counter
/// fills the lower half. `Builder::from_random_bytes` stamps the v4 version
/// and RFC 4122 variant bits.
fn correlation_id() -> Uuid {
    static SEED: LazyLock<u64> = LazyLock::new(|| Uuid::new_v4().as_u64_pair().0);
    static SEQ: AtomicU64 = AtomicU64::new(0);

    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    let raw = (((*SEED as u128) << 64) | n as u128).to_be_bytes();
    uuid::Builder::from_random_bytes(raw).into_uuid()
}

/// Opens an info span per request, keyed by correlation id.
#[derive(Clone, Debug)]
pub struct RequestSpan;

impl<B> tower_http::trace::MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &hyper::Request<B>) -> tracing::Span {
        let request_id = match request
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
        {
            Some(upstream) => upstream.to_owned(),
            None => correlation_id().to_string(),
        };

        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

/// Logs the request line at info, its headers at debug after redaction.
#[derive(Clone, Debug)]
pub struct RequestLog;

impl<B> tower_http::trace::OnRequest<B> for RequestLog {
    fn on_request(&mut self, request: &hyper::Request<B>, _span: &tracing::Span) {
        info!(
            method = %request.method(),
            uri = %request.uri(),
            "Inbound request"
        );

        // Header formatting only runs when debug logging is on.
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                version = ?request.version(),
                headers = ?redacted(request.headers()),
                "Inbound headers"
            );
        }
    }
}

/// Logs status and latency at info, response headers at debug.
#[derive(Clone, Debug)]
pub struct ResponseLog;

impl<B> tower_http::trace::OnResponse<B> for ResponseLog {
    fn on_response(
        self,
        response: &hyper::Response<B>,
        latency: std::time::Duration,
        _span: &tracing::Span,
    ) {
        info!(
            status = %response.status().as_u16(),
            latency_ms = latency.as_millis(),
            "Response complete"
        );

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                version = ?response.version(),
                headers = ?redacted(response.headers()),
                "Outbound headers"
            );
        }
    }
}

/// Logs requests the failure classifier flagged (5xx or transport error).
#[derive(Clone, Debug)]
pub struct FailureLog;

impl tower_http::trace::OnFailure<tower_http::classify::ServerErrorsFailureClass> for FailureLog {
    fn on_failure(
        &mut self,
        failure: tower_http::classify::ServerErrorsFailureClass,
        latency: std::time::Duration,
        _span: &tracing::Span,
    ) {
        warn!(
            class = %failure,
            latency_ms = latency.as_millis(),
            "Request failed"
        );
    }
}

/// Borrowing Debug wrapper so redaction happens during formatting, not as a
/// separate allocating pass.
struct RedactedHeaders<'a>(&'a HeaderMap);

fn redacted(headers: &HeaderMap) -> RedactedHeaders<'_> {
    RedactedHeaders(headers)
}

fn is_redacted(name: &str) -> bool {
    REDACTED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

impl fmt::Debug for RedactedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Caps keep a hostile header block from flooding the log stream.
        const HEADER_CAP: usize = 50;
        const VALUE_CAP: usize = 1024;

        let mut map = f.debug_map();
        for (idx, (name, value)) in self.0.iter().enumerate() {
            if idx == HEADER_CAP {
                map.entry(&"...", &format!("(+{} more)", self.0.len() - idx));
                break;
            }

            let name = name.as_str();
            if is_redacted(name) {
                map.entry(&name, &"[REDACTED]");
                continue;
            }

            // to_str succeeds only for visible ASCII, so byte slicing below
            // cannot split a character.
            match value.to_str() {
                Ok(text) if text.len() <= VALUE_CAP => map.entry(&name, &text),
                Ok(text) => map.entry(
                    &name,
                    &format!("{}... [{} bytes]", &text[..VALUE_CAP], text.len()),
                ),
                Err(_) => map.entry(&name, &format!("[{} opaque bytes]", value.len())),
            };
        }
        map.finish()
    }
}

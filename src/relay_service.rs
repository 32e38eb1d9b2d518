//! Core relay dispatcher.
//!
//! `RelayService` owns the shared upstream client and walks every inbound
//! request through the same pipeline: access filtering, rate limiting,
//! preflight handling, target resolution, the optional same-origin redirect
//! and finally the streaming forward to the target. Rejections at any stage
//! still pass through the response rewriter so the caller always receives
//! the forced CORS headers.

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures_util::StreamExt;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, error, info, warn};

use crate::access_control::{origin_host, AccessControl, AccessDecision};
use crate::error::{RelayError, RelayResult};
use crate::metrics::{RelayMetrics, RequestOutcome};
use crate::rate_limiter::{ClientRateLimiter, RateLimitDecision};
use crate::relay_body::RelayBody;
use crate::relay_config::RelayConfig;
use crate::response_headers::{CorsRewriter, ResponseRewriter};
use crate::timeout::{StreamTimeouts, TimedBody};
use crate::url_resolver::{QueryTargetResolver, ResolvedTarget, TargetResolver};

/// Body type handed to the upstream client.
type ClientBody = BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Unified response body type so streamed upstream bodies and locally built
/// rejection bodies share one signature.
pub type UnifiedBody = BoxBody<Bytes, RelayError>;

/// Idle pooled connections are dropped after this long.
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

static RUSTLS_INIT: OnceLock<Result<(), ()>> = OnceLock::new();

/// Shared relay state: upstream client, policy objects and metrics.
///
/// Cloning is cheap, every clone talks to the same connection pool and the
/// same rate-limit table.
#[derive(Clone)]
pub struct RelayService {
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, ClientBody>,
    config: Arc<RelayConfig>,
    access: AccessControl,
    limiter: Arc<ClientRateLimiter>,
    metrics: Arc<RelayMetrics>,
    resolver: Arc<dyn TargetResolver>,
    rewriter: Arc<dyn ResponseRewriter>,
    /// Lowercase request header names stripped before forwarding.
    remove_headers: HashSet<String>,
    /// Cancelled by the server once the drain window has passed, ends any
    /// response stream that is still running.
    stream_stop: CancellationToken,
}

impl RelayService {
    /// Build the service and its HTTPS-capable upstream client.
    pub fn new(
        config: Arc<RelayConfig>,
        limiter: Arc<ClientRateLimiter>,
        metrics: Arc<RelayMetrics>,
        stream_stop: CancellationToken,
    ) -> RelayResult<Self> {
        let init = RUSTLS_INIT.get_or_init(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .map_err(|_| ())
        });
        if init.is_err() {
            return Err(RelayError::Connection(
                "Failed to install TLS crypto provider".to_string(),
            ));
        }

        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(config.tcp_nodelay);
        http_connector.enforce_http(false);

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| {
                RelayError::Connection(format!("Native TLS roots unavailable: {}", e))
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .http1_preserve_header_case(true)
            .http1_title_case_headers(true)
            .http1_allow_obsolete_multiline_headers_in_responses(true)
            .http2_keep_alive_while_idle(true)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(std::time::Duration::from_secs(POOL_IDLE_TIMEOUT_SECS))
            .build(https_connector);

        let access = AccessControl::new(
            config.origin_blacklist.iter().cloned(),
            config.origin_whitelist.iter().cloned(),
            config.required_headers.iter().cloned(),
        );
        let rewriter = Arc::new(CorsRewriter::new(&config.set_response_headers));
        let remove_headers = config
            .remove_headers
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .collect();

        Ok(Self {
            client,
            config,
            access,
            limiter,
            metrics,
            resolver: Arc::new(QueryTargetResolver),
            rewriter,
            remove_headers,
            stream_stop,
        })
    }

    /// Swap in a different target resolver.
    #[cfg(test)]
    pub fn with_resolver(mut self, resolver: Arc<dyn TargetResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Bind this service to one inbound connection's peer address.
    pub fn bind(&self, client_addr: SocketAddr) -> BoundRelayService {
        BoundRelayService {
            service: self.clone(),
            client_addr,
        }
    }

    /// Run one request through the relay pipeline.
    ///
    /// Policy rejections come back as `Ok` responses carrying the forced CORS
    /// headers. `Err` is reserved for states with no peer left to answer or a
    /// response that could not be built at all.
    pub async fn handle_request(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> RelayResult<Response<UnifiedBody>> {
        let origin = req
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let original_query = req.uri().query().unwrap_or("").to_owned();

        if let AccessDecision::Deny { reason } = self.access.evaluate(origin.as_deref(), req.headers()) {
            info!(
                origin = origin.as_deref().unwrap_or(""),
                client = %client_addr,
                %reason,
                "Request denied by access filter"
            );
            return Ok(self.reject(RelayError::AccessDenied(reason)));
        }

        let client_key = client_rate_key(origin.as_deref(), client_addr);
        if let RateLimitDecision::Limited { retry_after_secs } = self.limiter.check(&client_key) {
            info!(client = %client_key, retry_after_secs, "Request rate limited");
            return Ok(self.reject(RelayError::RateLimited { retry_after_secs }));
        }

        if is_preflight(&req) {
            debug!(
                origin = origin.as_deref().unwrap_or(""),
                "Answering CORS preflight"
            );
            return self.preflight_response(req.headers());
        }

        let resolved = match self.resolver.resolve(req.uri()) {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!(uri = %req.uri(), error = %e, "No usable relay target");
                return Ok(self.reject(e));
            }
        };

        if self.config.redirect_same_origin
            && let Some(origin) = origin.as_deref()
            && same_origin_target(origin, &resolved.target)
        {
            info!(target = %resolved.target, "Target shares the caller's origin, redirecting");
            return self.redirect_response(&resolved.target);
        }

        match self.forward(req, &resolved, &original_query).await {
            Ok(response) => Ok(response),
            // The caller is gone, there is nothing useful to send back.
            Err(RelayError::ClientDisconnect) => Err(RelayError::ClientDisconnect),
            Err(e) => {
                warn!(target = %resolved.target, error = %e, "Forwarding failed");
                Ok(self.reject(e))
            }
        }
    }

    /// Forward a request to its resolved target and stream the answer back.
    async fn forward(
        &self,
        req: Request<Incoming>,
        resolved: &ResolvedTarget,
        original_query: &str,
    ) -> RelayResult<Response<UnifiedBody>> {
        let (parts, inbound_body) = req.into_parts();

        info!(method = %parts.method, target = %resolved.target, "Relaying request");

        let mut outbound = Request::builder()
            .method(parts.method.clone())
            .uri(resolved.target.clone())
            .version(parts.version);

        let headers = outbound.headers_mut().ok_or_else(|| {
            error!("Outbound request builder lost its header map");
            RelayError::Connection("outbound request could not be assembled".to_string())
        })?;
        *headers = self.forwarded_headers(&parts.headers);

        let body_stream = BodyStream::new(inbound_body);
        let mapped_stream = body_stream.map(|result| {
            result.map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
                Box::new(std::io::Error::other(format!("inbound body failed: {}", e)))
            })
        });
        let outbound_body: ClientBody = BodyExt::boxed(StreamBody::new(mapped_stream));

        let outbound = outbound.body(outbound_body).map_err(|e| {
            error!(error = %e, "Failed to build outbound request");
            RelayError::Connection(format!("outbound request invalid: {}", e))
        })?;

        let scheme = resolved
            .target
            .scheme_str()
            .unwrap_or("http")
            .to_owned();
        let started = Instant::now();
        let upstream = match tokio::time::timeout(
            self.config.outbound_timeout,
            self.client.request(outbound),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(map_upstream_error(e)),
            Err(_) => {
                return Err(RelayError::Timeout(format!(
                    "No response from target within {}s",
                    self.config.outbound_timeout.as_secs()
                )));
            }
        };
        self.metrics
            .record_upstream_duration(&scheme, started.elapsed().as_secs_f64() * 1000.0);

        let status = upstream.status();
        debug!(status = %status, target = %resolved.target, "Upstream answered");

        let (mut parts, body) = upstream.into_parts();

        let timeouts = StreamTimeouts::new(
            self.config.stream_chunk_timeout,
            self.config.stream_total_timeout,
        );
        let timed = TimedBody::new(body, timeouts);
        let counted = RelayBody::new(
            timed,
            self.stream_stop.child_token(),
            self.metrics.bytes_relayed_total.clone(),
        );
        let response_stream = BodyStream::new(counted).map(|result| {
            result.map_err(|e| RelayError::Connection(format!("upstream body failed: {}", e)))
        });
        let response_body: UnifiedBody = BodyExt::boxed(StreamBody::new(response_stream));

        self.rewriter.rewrite(&mut parts.headers, original_query);
        self.metrics.record_outcome(RequestOutcome::Relayed);

        Ok(Response::from_parts(parts, response_body))
    }

    /// Copy inbound headers, dropping configured, hop-by-hop and host headers.
    fn forwarded_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(inbound.len());
        for (name, value) in inbound {
            if self.remove_headers.contains(name.as_str()) {
                debug!(header = name.as_str(), "Stripped configured request header");
                continue;
            }
            // The client derives host from the target URI.
            if name == header::HOST || is_hop_by_hop_header(name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers
    }

    /// Answer a CORS preflight without contacting the target.
    ///
    /// The requested method and headers are echoed back as allowed, the relay
    /// itself imposes no restrictions.
    fn preflight_response(&self, inbound: &HeaderMap) -> RelayResult<Response<UnifiedBody>> {
        let mut response = Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .map_err(|e| RelayError::Connection(format!("Failed to build response: {}", e)))?;

        let headers = response.headers_mut();
        if let Some(method) = inbound.get(header::ACCESS_CONTROL_REQUEST_METHOD) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, method.clone());
        }
        if let Some(requested) = inbound.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        self.rewriter.rewrite(headers, "");
        self.metrics.record_outcome(RequestOutcome::Preflight);
        Ok(response)
    }

    /// Send the caller directly to a target it could reach itself.
    fn redirect_response(&self, target: &Uri) -> RelayResult<Response<UnifiedBody>> {
        let location = HeaderValue::try_from(target.to_string()).map_err(|e| {
            RelayError::InvalidTarget(format!("Target unusable as location header: {}", e))
        })?;

        let mut response = Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .body(empty_body())
            .map_err(|e| RelayError::Connection(format!("Failed to build response: {}", e)))?;

        let headers = response.headers_mut();
        headers.insert(header::LOCATION, location);
        // The answer depends on the caller's origin, keep shared caches out.
        headers.insert(header::VARY, HeaderValue::from_static("origin"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private"));
        self.rewriter.rewrite(headers, "");
        self.metrics.record_outcome(RequestOutcome::Redirected);
        Ok(response)
    }

    /// Turn a pipeline error into its HTTP response, CORS headers included.
    fn reject(&self, error: RelayError) -> Response<UnifiedBody> {
        self.metrics.record_outcome(outcome_for(&error));
        let mut response = error
            .to_response()
            .map(|body| body.map_err(|e| match e {}).boxed());
        // Without the forced CORS headers the browser would hide the status
        // and body from the calling page.
        self.rewriter.rewrite(response.headers_mut(), "");
        response
    }
}

/// Per-connection handle that carries the peer address into the pipeline.
#[derive(Clone)]
pub struct BoundRelayService {
    service: RelayService,
    client_addr: SocketAddr,
}

impl Service<Request<Incoming>> for BoundRelayService {
    type Response = Response<UnifiedBody>;
    type Error = RelayError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let service = self.service.clone();
        let client_addr = self.client_addr;
        Box::pin(async move { service.handle_request(req, client_addr).await })
    }
}

fn empty_body() -> UnifiedBody {
    http_body_util::Full::new(Bytes::new())
        .map_err(|e| match e {})
        .boxed()
}

/// Rate-limit key: the caller's origin host when one is present, otherwise
/// the remote address.
fn client_rate_key(origin: Option<&str>, client_addr: SocketAddr) -> String {
    match origin.map(origin_host) {
        Some(host) if !host.is_empty() => host,
        _ => client_addr.ip().to_string(),
    }
}

/// A preflight is an OPTIONS request announcing the method it asks about.
fn is_preflight<B>(req: &Request<B>) -> bool {
    req.method() == Method::OPTIONS
        && req
            .headers()
            .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
}

/// True when the resolved target lives under the caller's own origin, i.e.
/// the target string starts with `<origin>/`.
fn same_origin_target(origin: &str, target: &Uri) -> bool {
    let origin = origin.trim().trim_end_matches('/').to_ascii_lowercase();
    if origin.is_empty() {
        return false;
    }
    let href = target.to_string().to_ascii_lowercase();
    match href.strip_prefix(&origin) {
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

fn outcome_for(error: &RelayError) -> RequestOutcome {
    match error {
        RelayError::AccessDenied(_) => RequestOutcome::AccessDenied,
        RelayError::RateLimited { .. } => RequestOutcome::RateLimited,
        RelayError::InvalidTarget(_) => RequestOutcome::InvalidTarget,
        _ => RequestOutcome::GatewayError,
    }
}

/// Map client transport failures onto the relay error taxonomy.
fn map_upstream_error(error: hyper_util::client::legacy::Error) -> RelayError {
    classify_upstream_error(&error.to_string())
}

/// Classify a transport failure by its message.
///
/// `inbound body` is the marker `forward` stamps on outbound-body errors, so
/// it is the only text that means the caller went away. An upstream that
/// closes or resets mid-exchange is a gateway failure the caller must still
/// hear about, CORS headers included.
fn classify_upstream_error(error_text: &str) -> RelayError {
    let lower = error_text.to_lowercase();

    if lower.contains("inbound body") {
        RelayError::ClientDisconnect
    } else if lower.contains("refused") {
        RelayError::ConnectionRefused(format!("Target refused connection: {error_text}"))
    } else if lower.contains("timeout") || lower.contains("timed out") {
        RelayError::Timeout(format!("Target timed out: {error_text}"))
    } else {
        RelayError::Connection(format!("Upstream request failed: {error_text}"))
    }
}

/// Hop-by-hop headers must not travel past the relay.
///
/// `connection`, `upgrade` and `transfer-encoding` are left alone on purpose,
/// hyper manages those itself per connection.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "keep-alive" | "proxy-authenticate" | "proxy-authorization" | "te" | "trailers"
    )
}

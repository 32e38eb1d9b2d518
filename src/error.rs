//! Error types for the relay pipeline.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Errors produced while handling a relayed request.
///
/// Every variant converts to a well-formed plain-text response via
/// [`RelayError::to_response`]. Nothing in the pipeline is allowed to drop a
/// connection without an answer, except `ClientDisconnect` where no peer
/// remains to receive one.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Origin rejected by the access filter (maps to 403 Forbidden)
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Per-client quota exhausted (maps to 429 Too Many Requests)
    #[error("Rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// No usable target URL in the request (maps to 400 Bad Request)
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Connection error reaching the target (maps to 502 Bad Gateway)
    #[error("Upstream connection failed: {0}")]
    Connection(String),

    /// Connection refused by the target (maps to 502 Bad Gateway)
    #[error("Target refused the connection: {0}")]
    ConnectionRefused(String),

    /// Target did not answer within the outbound timeout (maps to 504)
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Client went away mid-flight; close the outbound side, send nothing
    #[error("Client went away mid-request")]
    ClientDisconnect,
}

impl RelayError {
    /// Convert the error to an HTTP response with the appropriate status.
    ///
    /// Rate-limit rejections carry a `Retry-After` header so well-behaved
    /// callers can back off without parsing the body.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let (status, message) = match self {
            RelayError::AccessDenied(reason) => {
                (StatusCode::FORBIDDEN, format!("403 Forbidden\n\n{reason}"))
            }
            RelayError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                format!(
                    "429 Too Many Requests\n\nRate limit exceeded. Try again in {retry_after_secs} seconds."
                ),
            ),
            RelayError::InvalidTarget(reason) => (
                StatusCode::BAD_REQUEST,
                format!("400 Bad Request\n\n{reason}"),
            ),
            RelayError::ConnectionRefused(_) | RelayError::Connection(_) => (
                StatusCode::BAD_GATEWAY,
                "502 Bad Gateway\n\nFailed to reach the target server.".to_string(),
            ),
            RelayError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "504 Gateway Timeout\n\nThe target server did not respond in time.".to_string(),
            ),
            RelayError::ClientDisconnect => (
                StatusCode::BAD_REQUEST,
                "400 Bad Request\n\nClient went away before the response completed.".to_string(),
            ),
        };

        let mut builder = Response::builder()
            .status(status)
            .header("content-type", "text/plain");
        if let RelayError::RateLimited { retry_after_secs } = self {
            builder = builder.header("retry-after", retry_after_secs.to_string());
        }

        builder
            .body(Full::new(Bytes::from(message)))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(Full::new(Bytes::from("500 Internal Server Error\n\nError response could not be constructed.")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }
}

/// Result type alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

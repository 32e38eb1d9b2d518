//! Mock origin server for relay integration tests.
//!
//! Serves canned responses on configured paths and records what the relay
//! actually sent, so tests can assert on stripped headers and forwarded
//! paths.

#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// A canned response for one path.
#[derive(Debug, Clone)]
pub struct CannedResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Vec<u8>,
    pub extra_headers: Vec<(String, String)>,
}

/// Builder for the origin: canned responses per path, plus optional
/// per-path delays for timeout scenarios.
#[derive(Debug, Clone)]
pub struct MockOrigin {
    responses: HashMap<String, CannedResponse>,
    delays: HashMap<String, Duration>,
}

/// State shared between the serving task and the test's handle.
#[derive(Debug)]
struct OriginState {
    responses: HashMap<String, CannedResponse>,
    delays: HashMap<String, Duration>,
    request_count: RwLock<u32>,
    last_headers: RwLock<Option<HashMap<String, String>>>,
    last_path_and_query: RwLock<Option<String>>,
}

impl MockOrigin {
    /// Create a new mock origin with no canned responses.
    #[must_use]
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
            delays: HashMap::new(),
        }
    }

    /// Serve `body` at `path` with the given status and content type.
    #[must_use]
    pub fn with_response(
        mut self,
        path: &str,
        status: StatusCode,
        content_type: &str,
        body: &[u8],
    ) -> Self {
        self.responses.insert(
            path.to_string(),
            CannedResponse {
                status,
                content_type: content_type.to_string(),
                body: body.to_vec(),
                extra_headers: Vec::new(),
            },
        );
        self
    }

    /// Attach an extra response header to an already configured path.
    #[must_use]
    pub fn with_header(mut self, path: &str, name: &str, value: &str) -> Self {
        if let Some(canned) = self.responses.get_mut(path) {
            canned
                .extra_headers
                .push((name.to_string(), value.to_string()));
        }
        self
    }

    /// Add a delay before answering on `path`.
    #[must_use]
    pub fn with_delay(mut self, path: &str, delay: Duration) -> Self {
        self.delays.insert(path.to_string(), delay);
        self
    }

    /// Bind an ephemeral port and start serving. Returns the bound address
    /// and a handle for inspecting recorded traffic.
    pub async fn start(self) -> (SocketAddr, MockOriginHandle) {
        let state = Arc::new(OriginState {
            responses: self.responses,
            delays: self.delays,
            request_count: RwLock::new(0),
            last_headers: RwLock::new(None),
            last_path_and_query: RwLock::new(None),
        });

        let app = Router::new()
            .fallback(handle_request)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (
            addr,
            MockOriginHandle {
                state,
                _handle: handle,
            },
        )
    }
}

impl Default for MockOrigin {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the running mock origin.
pub struct MockOriginHandle {
    state: Arc<OriginState>,
    _handle: JoinHandle<()>,
}

impl MockOriginHandle {
    /// Total requests the origin has answered.
    pub async fn request_count(&self) -> u32 {
        *self.state.request_count.read().await
    }

    /// Headers of the most recent request, lowercased names.
    pub async fn last_headers(&self) -> Option<HashMap<String, String>> {
        self.state.last_headers.read().await.clone()
    }

    /// Path plus query of the most recent request.
    pub async fn last_path_and_query(&self) -> Option<String> {
        self.state.last_path_and_query.read().await.clone()
    }
}

/// Record the request, then answer from the canned table.
async fn handle_request(State(state): State<Arc<OriginState>>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| path.clone());

    {
        let mut count = state.request_count.write().await;
        *count += 1;
    }
    {
        let mut headers = HashMap::new();
        for (name, value) in req.headers() {
            headers.insert(
                name.as_str().to_string(),
                value.to_str().unwrap_or("<binary>").to_string(),
            );
        }
        *state.last_headers.write().await = Some(headers);
    }
    *state.last_path_and_query.write().await = Some(path_and_query);

    if let Some(delay) = state.delays.get(&path) {
        tokio::time::sleep(*delay).await;
    }

    match state.responses.get(&path) {
        Some(canned) => {
            let mut builder = Response::builder()
                .status(canned.status)
                .header(header::CONTENT_TYPE, &canned.content_type);
            for (name, value) in &canned.extra_headers {
                builder = builder.header(name, value);
            }
            builder.body(Body::from(canned.body.clone())).unwrap()
        }
        None => (StatusCode::NOT_FOUND, "no canned response for this path").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_origin_serves_canned_response_and_records_request() {
        let mock = MockOrigin::new().with_response(
            "/data.json",
            StatusCode::OK,
            "application/json",
            br#"{"ok":true}"#,
        );

        let (addr, handle) = mock.start().await;

        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://{}/data.json?x=1", addr))
            .header("x-probe", "yes")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), r#"{"ok":true}"#);
        assert_eq!(handle.request_count().await, 1);
        assert_eq!(
            handle.last_path_and_query().await.as_deref(),
            Some("/data.json?x=1")
        );
        let headers = handle.last_headers().await.unwrap();
        assert_eq!(headers.get("x-probe").map(String::as_str), Some("yes"));
    }
}

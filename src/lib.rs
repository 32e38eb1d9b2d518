//! CORS forward relay.
//!
//! This crate contains the relay pipeline, the HTTP server plumbing and the
//! admin surface for a proxy that fetches arbitrary HTTP and HTTPS targets
//! on behalf of browser pages and answers with CORS headers attached.

pub mod access_control;
pub mod admin;
pub mod error;
pub mod lifecycle;
pub mod logging_layer;
pub mod metrics;
pub mod ports;
pub mod rate_limiter;
pub mod relay_body;
pub mod relay_config;
pub mod relay_service;
pub mod response_headers;
pub mod timeout;
pub mod url_resolver;

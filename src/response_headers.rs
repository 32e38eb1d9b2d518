//! Response header rewriting.
//!
//! Every response leaving the relay passes through here: configured header
//! overrides are applied unconditionally (the deployment default forces
//! `access-control-allow-origin: *`), and when the original inbound query
//! asked for a named download, a `content-disposition` attachment header is
//! injected.
//!
//! The disposition step re-parses the ORIGINAL inbound query, never the
//! outbound target's, because target resolution may have consumed or altered
//! the `download`/`filename` parameters.

use http::header::{CONTENT_DISPOSITION, HeaderMap, HeaderName, HeaderValue};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::warn;

use crate::url_resolver::{ParamValue, parse_url_params};

/// Characters left intact by JavaScript's `encodeURI`, which the original
/// deployment used to build download filenames. Space encodes to `%20`;
/// URI-reserved punctuation passes through.
const ENCODE_URI_KEEP: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b';')
    .remove(b',')
    .remove(b'/')
    .remove(b'?')
    .remove(b':')
    .remove(b'@')
    .remove(b'&')
    .remove(b'=')
    .remove(b'+')
    .remove(b'$')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'#');

/// Percent-encode a filename the way `encodeURI` does.
pub fn encode_uri(input: &str) -> String {
    utf8_percent_encode(input, ENCODE_URI_KEEP).to_string()
}

/// Strategy for rewriting response headers before they reach the caller.
///
/// Injected into the dispatcher at construction time; `original_query` is
/// the inbound request's query string, recorded by the dispatcher before
/// forwarding and therefore always available here.
pub trait ResponseRewriter: Send + Sync {
    /// Rewrite `headers` in place.
    fn rewrite(&self, headers: &mut HeaderMap, original_query: &str);
}

/// Default rewriter: forced header overrides plus the download-disposition
/// convention.
#[derive(Debug, Clone)]
pub struct CorsRewriter {
    overrides: Vec<(HeaderName, HeaderValue)>,
}

impl CorsRewriter {
    /// Build from configured `name: value` overrides.
    ///
    /// Entries that are not valid header names or values are skipped with a
    /// warning rather than failing startup.
    pub fn new(set_response_headers: &[(String, String)]) -> Self {
        let mut overrides = Vec::with_capacity(set_response_headers.len());
        for (name, value) in set_response_headers {
            match (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => overrides.push((name, value)),
                _ => warn!(
                    header = %name,
                    "Skipping invalid response header override"
                ),
            }
        }
        Self { overrides }
    }
}

impl ResponseRewriter for CorsRewriter {
    fn rewrite(&self, headers: &mut HeaderMap, original_query: &str) {
        for (name, value) in &self.overrides {
            headers.insert(name.clone(), value.clone());
        }

        let params = parse_url_params(original_query);
        let download_requested = params
            .get("download")
            .is_some_and(|p| matches!(p, ParamValue::Flag) || p.as_value().is_some());
        let filename = params.get("filename").and_then(ParamValue::as_value);

        if download_requested
            && let Some(filename) = filename
        {
            let encoded = encode_uri(filename);
            let disposition =
                format!("attachment; filename=\"{encoded}\"; filename*=UTF-8''{encoded}");
            match HeaderValue::from_str(&disposition) {
                Ok(value) => {
                    headers.insert(CONTENT_DISPOSITION, value);
                }
                Err(_) => warn!(
                    filename = %filename,
                    "Download filename did not encode to a valid header value"
                ),
            }
        }
    }
}

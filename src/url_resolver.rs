//! Target URL extraction from inbound requests.
//!
//! A relayed request names its destination one of three ways, in precedence
//! order: a `url` query parameter, a `download` query parameter, or the
//! request path itself with the leading `/` stripped
//! (`GET /https://example.com/data`). Query parameters are decoded once into
//! a tagged map so later stages never re-interpret raw query text.

use std::collections::HashMap;

use http::Uri;
use percent_encoding::percent_decode_str;

use crate::error::{RelayError, RelayResult};

/// A single query parameter, decoded.
///
/// `?download&filename=a.txt` parses as `download` → `Flag` and
/// `filename` → `Value("a.txt")`. Only `Value` forms can supply a target
/// URL; a bare flag never does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    /// Parameter present without `=`
    Flag,
    /// Parameter with a percent-decoded value
    Value(String),
}

impl ParamValue {
    /// The decoded value, if this is a non-empty `Value`.
    pub fn as_value(&self) -> Option<&str> {
        match self {
            ParamValue::Value(v) if !v.is_empty() => Some(v),
            _ => None,
        }
    }
}

/// Decode a raw query string into a parameter map.
///
/// Splits on `&`, drops empty segments, and splits each segment at the first
/// `=`. Values are percent-decoded with invalid UTF-8 replaced. Duplicate
/// names keep the last occurrence.
pub fn parse_url_params(query: &str) -> HashMap<String, ParamValue> {
    let mut params = HashMap::new();
    for part in query.split('&').filter(|p| !p.is_empty()) {
        match part.split_once('=') {
            None => {
                params.insert(part.to_string(), ParamValue::Flag);
            }
            Some((name, value)) => {
                let decoded = percent_decode_str(value).decode_utf8_lossy().into_owned();
                params.insert(name.to_string(), ParamValue::Value(decoded));
            }
        }
    }
    params
}

/// The destination extracted from an inbound request.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    /// Validated absolute target URI (http or https)
    pub target: Uri,
}

/// Strategy for extracting the target URL from an inbound request URI.
///
/// Injected into the dispatcher at construction time so alternative
/// extraction schemes (or test doubles) can slot in without touching the
/// forwarding path.
pub trait TargetResolver: Send + Sync {
    /// Extract and validate the destination for this request.
    fn resolve(&self, uri: &Uri) -> RelayResult<ResolvedTarget>;
}

/// Default resolver: `url` param, else `download` param, else path suffix.
#[derive(Debug, Clone, Default)]
pub struct QueryTargetResolver;

impl TargetResolver for QueryTargetResolver {
    fn resolve(&self, uri: &Uri) -> RelayResult<ResolvedTarget> {
        let query = uri.query().unwrap_or("");
        let params = parse_url_params(query);

        let from_params = params
            .get("url")
            .and_then(ParamValue::as_value)
            .or_else(|| params.get("download").and_then(ParamValue::as_value));

        // Path fallback keeps the query attached: /http://x/y?a=1 relays to
        // http://x/y?a=1 verbatim.
        let raw = match from_params {
            Some(target) => target.to_string(),
            None => {
                let path_and_query = uri
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or_else(|| uri.path());
                path_and_query.trim_start_matches('/').to_string()
            }
        };

        if raw.is_empty() {
            return Err(RelayError::InvalidTarget(
                "No target URL. Name the destination as /<url>, ?url=<url> or ?download=<url>."
                    .to_string(),
            ));
        }

        let target = validate_target(&raw)?;
        Ok(ResolvedTarget { target })
    }
}

/// Parse and validate a raw target string as an absolute http(s) URI.
pub fn validate_target(raw: &str) -> RelayResult<Uri> {
    let uri: Uri = raw
        .parse()
        .map_err(|_| RelayError::InvalidTarget(format!("Not a valid URL: {raw}")))?;

    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        Some(other) => {
            return Err(RelayError::InvalidTarget(format!(
                "Unsupported scheme: {other}. Only http and https targets are relayed."
            )));
        }
        None => {
            return Err(RelayError::InvalidTarget(format!(
                "Target URL must be absolute (include http:// or https://): {raw}"
            )));
        }
    }

    if uri.host().is_none() {
        return Err(RelayError::InvalidTarget(format!(
            "Target URL has no host: {raw}"
        )));
    }

    Ok(uri)
}

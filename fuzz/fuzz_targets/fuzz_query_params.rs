#![no_main]

//! Fuzz target for query string parameter parsing
//!
//! - Tests: url_resolver::parse_url_params
//! - Attack surface: malformed percent escapes, truncated UTF-8, repeated
//!   keys, keys with embedded separators

use libfuzzer_sys::fuzz_target;
use corsrelay::url_resolver::{ParamValue, parse_url_params};

fuzz_target!(|query: &str| {
    // Must never panic, whatever the query looks like.
    let params = parse_url_params(query);

    // Parsing is deterministic.
    assert_eq!(params, parse_url_params(query));

    for (key, value) in &params {
        // Keys are split tokens, so separators cannot survive in them.
        assert!(!key.contains('&'));

        // as_value surfaces exactly the non-empty assignments.
        match value {
            ParamValue::Flag => assert_eq!(value.as_value(), None),
            ParamValue::Value(v) if v.is_empty() => assert_eq!(value.as_value(), None),
            ParamValue::Value(v) => assert_eq!(value.as_value(), Some(v.as_str())),
        }
    }
});

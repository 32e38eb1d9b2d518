#![no_main]

//! Fuzz target for destination extraction
//!
//! - Tests: url_resolver::QueryTargetResolver::resolve
//! - Attack surface: malformed URLs in path and query position, scheme
//!   smuggling, userinfo tricks, missing hosts

use libfuzzer_sys::fuzz_target;
use arbitrary::Arbitrary;
use corsrelay::url_resolver::{QueryTargetResolver, TargetResolver};
use http::Uri;

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    path: Vec<u8>,
    query: Option<Vec<u8>>,
}

fuzz_target!(|input: FuzzInput| {
    fuzz_resolution(input);
});

fn fuzz_resolution(input: FuzzInput) {
    let path = String::from_utf8_lossy(&input.path);
    let mut raw = format!("/{}", path);
    if let Some(query) = &input.query {
        raw.push('?');
        raw.push_str(&String::from_utf8_lossy(query));
    }

    let uri: Uri = match raw.parse() {
        Ok(u) => u,
        Err(_) => return, // hyper would have rejected it before us
    };

    // resolve must never panic, and anything it accepts must be a
    // fully-qualified http(s) URL. Everything else is a clean error.
    match QueryTargetResolver.resolve(&uri) {
        Ok(resolved) => {
            let scheme = resolved.target.scheme_str();
            assert!(scheme == Some("http") || scheme == Some("https"));
            assert!(resolved.target.host().is_some());
        }
        Err(_) => {}
    }
}

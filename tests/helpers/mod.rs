//! Test helpers for relay integration tests.
//!
//! This module provides reusable utilities for exercising the relay
//! end to end:
//! - Mock origin server with canned responses and request capture
//! - In-process relay harness on ephemeral ports

#![allow(unused_imports)] // Re-exports may not be used by all test files

pub mod mock_origin;
pub mod relay_harness;

pub use mock_origin::*;
pub use relay_harness::*;

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test attribute macro that initializes tracing before running the test.
//!
//! Import it with `use test_with_tracing::test;` to shadow the built-in
//! `#[test]` attribute in a test module.

// Lets the macro's `::test_with_tracing` paths resolve in this crate's tests.
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;

use std::sync::Once;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Installs a global subscriber that writes to the test harness's captured
/// output. The filter defaults to `debug` and can be overridden with
/// `RUST_LOG`.
///
/// Safe to call any number of times; only the first call has an effect.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::DEBUG.into())
            .from_env_lossy();
        // Another subscriber may already be installed by the test binary.
        let _ = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_test_writer()
            .with_env_filter(filter)
            .try_init();
    });
}

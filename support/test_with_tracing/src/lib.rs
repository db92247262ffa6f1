// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provides a `#[test]` attribute that routes `tracing` output for the test
//! into the libtest capture buffer.
//!
//! ```ignore
//! #[test_with_tracing::test]
//! fn cycles_once() {
//!     tracing::info!("visible with --nocapture or on failure");
//! }
//! ```

pub use test_with_tracing_macro::test;

// Lets the generated `::test_with_tracing::init()` path resolve in this
// crate's own tests.
#[cfg(test)]
extern crate self as test_with_tracing;

use std::sync::Once;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Installs the global test subscriber. Called by the generated test body;
/// only the first call in a test binary has an effect.
#[doc(hidden)]
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::DEBUG.into())
            .from_env_lossy();

        // Another harness may already own the global default.
        let _ = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_test_writer()
            .with_env_filter(filter)
            .try_init();
    });
}

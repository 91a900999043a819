//! Tracing setup for tests and examples.
//!
//! The library itself only emits `tracing` events; installing a
//! subscriber is the embedder's business. Tests call `init_for_tests`
//! to get env-filtered compact output without fighting over the global
//! default.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a compact, env-filtered subscriber once per process.
/// Subsequent calls (and races with an embedder-installed subscriber)
/// are no-ops.
pub fn init_for_tests() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .compact()
            .try_init();
    });
}

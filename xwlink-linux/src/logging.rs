//! Tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. RUST_LOG wins over `default_level`.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // A second init (tests) is harmless.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

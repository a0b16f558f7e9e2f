//! Tracing subscriber setup for the `easycluster` binary.

use tracing_subscriber::EnvFilter;

/// Builds the filter for `level`. `RUST_LOG`, when set and valid, wins.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global fmt subscriber. Later calls are ignored.
pub fn init(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_target(false)
        .try_init();
}

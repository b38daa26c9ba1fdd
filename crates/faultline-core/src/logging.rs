//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a compact fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Panics if a global subscriber is already installed.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(false)
        .compact()
        .init();
}

/// Like [`init`], but leaves an existing subscriber in place.
pub fn try_init() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}

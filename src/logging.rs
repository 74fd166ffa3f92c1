//! Process-wide tracing setup.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global fmt subscriber, filtered by `RUST_LOG`.
///
/// Defaults to `info` when the variable is unset. Safe to call more than
/// once; later calls are no-ops, so tests and embedders can both use it.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

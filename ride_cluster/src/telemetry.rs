//! Logging setup shared by the binaries.

use tracing_subscriber::EnvFilter;

/// `RUST_LOG` if set, `info` otherwise.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

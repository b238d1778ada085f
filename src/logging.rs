//! Log output for the binaries.
//!
//! The library logs through the `log` facade; the subscriber installed here
//! also picks up those records (including actix's request logger).

use tracing_subscriber::EnvFilter;

/// Installs a formatter filtered by `RUST_LOG`, `info` when unset. Output
/// goes to stderr so `classify_cli` can print JSON on stdout.
/// Calling it a second time is a no-op.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

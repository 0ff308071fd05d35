//! Tracing setup for the server binary.

use tracing_subscriber::EnvFilter;

/// Install the tracing subscriber. Everything goes to standard error; the
/// level defaults to `info` and is overridden with `RUST_LOG`.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

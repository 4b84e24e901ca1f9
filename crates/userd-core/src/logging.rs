//! Logging initialization for the service.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber.
///
/// The log level comes from `RUST_LOG` if set, otherwise from the
/// provided default. Safe to call more than once; only the first
/// call installs a subscriber.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

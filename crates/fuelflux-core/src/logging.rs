//! Logging initialization.
//!
//! The controller logs through `tracing`; the binary calls [`init_logging`]
//! once at startup. `RUST_LOG` takes precedence over the configured level.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// * `level` - Default log level (trace, debug, info, warn, error) used
///   when `RUST_LOG` is not set.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

//! `tracing` subscriber setup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,sitescope=debug";

/// Install the global tracing subscriber.
///
/// Honours `RUST_LOG`, falling back to `default_filter`. Returns `false` if a
/// global subscriber was already installed (repeat calls are harmless).
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .is_ok()
}

/// Install a subscriber that writes through the test harness capture.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_init_is_harmless() {
        init_test_tracing();
        assert!(!init_tracing(DEFAULT_FILTER));
    }
}

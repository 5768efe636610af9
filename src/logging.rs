//! Tracing setup for embedders.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "edge_guest_bridge=info";

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Returns `false` if a subscriber was
/// already installed.
pub fn init(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

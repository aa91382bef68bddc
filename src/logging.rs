//! Tracing setup for the binary entry point.
//!
//! The library itself never installs a subscriber — only `main.rs` does,
//! exactly once, with the layered `EnvFilter` + `fmt` pattern.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a global tracing subscriber reading `RUST_LOG` (default `info`).
pub fn init() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

//! Logging Module
//!
//! Thin `tracing-subscriber` bootstrap shared by the demonstration binaries.
//! The library itself never installs a subscriber — only emits `tracing`
//! spans and events — so embedding applications stay in control of their
//! own logging setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

/// Installs a compact, env-filterable tracing subscriber.
///
/// `default_level` is used when `RUST_LOG` is not set in the environment.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .compact()
        .init();
}

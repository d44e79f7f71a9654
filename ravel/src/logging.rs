// src/logging.rs
//! Tracing-subscriber initialization.
//!
//! The log level is controlled by `RUST_LOG` (`info` when unset):
//!
//! ```bash
//! RUST_LOG=debug cargo run --example service
//! RUST_LOG=ravel=debug cargo run --example service
//! ```

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. Call once at startup, before `start()`.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Like [`init_logging`] but quietly does nothing if a subscriber is already
/// set. Handy in tests where several cases race to initialize.
pub fn try_init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

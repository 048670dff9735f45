//! Logging utilities for the discovery proxy components.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Build the level filter, letting RUST_LOG override the configured level.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize tracing with the given default level.
///
/// `json` switches the fmt layer to structured JSON lines.
pub fn init_with(default_level: &str, json: bool) {
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter(default_level))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(env_filter(default_level))
            .init();
    }
}

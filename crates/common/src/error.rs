//! Common error types for the discovery proxy components.

use std::fmt;

/// A specialized Result type for discovery and proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for discovery and proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new coordination store error.
    pub fn store(msg: impl fmt::Display) -> Self {
        Error::Store(msg.to_string())
    }

    /// Create a new discovery error.
    pub fn discovery(msg: impl fmt::Display) -> Self {
        Error::Discovery(msg.to_string())
    }

    /// Create a new proxy error.
    pub fn proxy(msg: impl fmt::Display) -> Self {
        Error::Proxy(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }
}

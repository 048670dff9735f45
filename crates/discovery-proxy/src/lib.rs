//! Discovery Proxy
//!
//! HTTP/1 reverse proxy that resolves the first path segment of each request
//! to a service instance through the discovery broker and forwards the
//! request over a reused upstream connection.
//!
//! # Components
//!
//! - **ProxyServer**: accept loop, one task and one upstream pool per inbound connection
//! - **ProxyRouter**: per-request resolve/connect/forward state machine with bounded retry
//! - **UpstreamPool**: cached upstream connections keyed by `address:port`
//! - **MetricsServer**: optional Prometheus endpoint

pub mod config;
pub mod http_server;
pub mod metrics;
pub mod router;
pub mod server;
pub mod telemetry;
pub mod types;
pub mod upstream;

pub use config::{Config, ConfigError};
pub use http_server::MetricsServer;
pub use metrics::MetricsRegistry;
pub use router::{ProxyRouter, RouteError, service_name_from_path};
pub use server::ProxyServer;
pub use telemetry::{TelemetryGuard, init_telemetry, setup_tracing_with_otel};
pub use types::ProxyConfig;
pub use upstream::UpstreamPool;

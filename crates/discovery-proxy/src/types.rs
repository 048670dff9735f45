//! Runtime settings for the proxy server and router.

use std::time::Duration;

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen host
    pub host: String,

    /// Listen port
    pub port: u16,

    /// Upstream connect attempts allowed per inbound request
    pub upstream_retry_max: u32,

    /// Pause between attempts
    pub retry_backoff: Duration,

    /// Bound on TCP connect to an upstream instance
    pub connect_timeout: Duration,

    /// Largest request or response body buffered, in bytes
    pub max_aggregated_bytes: usize,

    /// Serve `/metrics`
    pub metrics_enabled: bool,

    /// Metrics endpoint address
    pub metrics_listen_addr: String,

    /// Request duration histogram buckets, in seconds
    pub metrics_duration_buckets: Vec<f64>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            upstream_retry_max: 3,
            retry_backoff: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            max_aggregated_bytes: 512 * 1024,
            metrics_enabled: false,
            metrics_listen_addr: "127.0.0.1:9102".to_string(),
            metrics_duration_buckets: vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
        }
    }
}

impl ProxyConfig {
    /// `host:port` to bind the proxy listener on
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

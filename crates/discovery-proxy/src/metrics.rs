//! Prometheus metrics for the discovery proxy.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::time::Duration;

/// Labels for proxied request outcomes
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// Outcome (forwarded, bad_request_routing, no_eligible_instance, ...)
    pub outcome: String,
}

/// Labels for success/failure counters
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    /// Result (success, failure)
    pub result: String,
}

/// Labels for error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error type (accept, connection, body_read, ...)
    pub error_type: String,
}

/// Metrics registry with all proxy metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    /// Proxied requests by outcome
    requests_total: Family<OutcomeLabels, Counter>,
    /// Time from request receipt to response or failure
    request_duration_seconds: Histogram,
    /// Service name resolutions
    resolutions_total: Family<ResultLabels, Counter>,
    /// Upstream connection attempts
    upstream_connects_total: Family<ResultLabels, Counter>,
    /// Retries taken
    retries_total: Counter,
    /// Requests served over a cached upstream connection
    connections_reused_total: Counter,
    /// Open inbound connections
    inbound_connections_active: Gauge,
    /// Errors by type
    errors_total: Family<ErrorLabels, Counter>,
}

impl MetricsRegistry {
    /// Create a new metrics registry with the given duration buckets
    pub fn new(duration_buckets: &[f64]) -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "discovery_proxy_requests",
            "Proxied requests by outcome",
            requests_total.clone(),
        );

        let request_duration_seconds = Histogram::new(duration_buckets.iter().copied());
        registry.register(
            "discovery_proxy_request_duration_seconds",
            "Proxied request duration in seconds",
            request_duration_seconds.clone(),
        );

        let resolutions_total = Family::<ResultLabels, Counter>::default();
        registry.register(
            "discovery_proxy_resolutions",
            "Service name resolutions by result",
            resolutions_total.clone(),
        );

        let upstream_connects_total = Family::<ResultLabels, Counter>::default();
        registry.register(
            "discovery_proxy_upstream_connects",
            "Upstream connection attempts by result",
            upstream_connects_total.clone(),
        );

        let retries_total = Counter::default();
        registry.register(
            "discovery_proxy_retries",
            "Upstream retries taken",
            retries_total.clone(),
        );

        let connections_reused_total = Counter::default();
        registry.register(
            "discovery_proxy_connections_reused",
            "Requests forwarded over a cached upstream connection",
            connections_reused_total.clone(),
        );

        let inbound_connections_active = Gauge::default();
        registry.register(
            "discovery_proxy_inbound_connections_active",
            "Open inbound connections",
            inbound_connections_active.clone(),
        );

        let errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "discovery_proxy_errors",
            "Total errors by type",
            errors_total.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            resolutions_total,
            upstream_connects_total,
            retries_total,
            connections_reused_total,
            inbound_connections_active,
            errors_total,
        }
    }

    /// Record a finished request
    pub fn record_request(&self, outcome: &str, duration: Duration) {
        self.requests_total
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();

        self.request_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Record a resolution, hit when an instance was produced
    pub fn record_resolution(&self, hit: bool) {
        self.resolutions_total
            .get_or_create(&ResultLabels {
                result: result_label(hit),
            })
            .inc();
    }

    /// Record an upstream connect attempt
    pub fn record_connect(&self, success: bool) {
        self.upstream_connects_total
            .get_or_create(&ResultLabels {
                result: result_label(success),
            })
            .inc();
    }

    /// Record a retry
    pub fn record_retry(&self) {
        self.retries_total.inc();
    }

    /// Record a forward over a cached connection
    pub fn record_reuse(&self) {
        self.connections_reused_total.inc();
    }

    /// Track an inbound connection opening
    pub fn connection_opened(&self) {
        self.inbound_connections_active.inc();
    }

    /// Track an inbound connection closing
    pub fn connection_closed(&self) {
        self.inbound_connections_active.dec();
    }

    /// Record error by type
    pub fn record_error(&self, error_type: &str) {
        self.errors_total
            .get_or_create(&ErrorLabels {
                error_type: error_type.to_string(),
            })
            .inc();
    }

    /// Encode the registry in Prometheus text format
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

fn result_label(success: bool) -> String {
    if success { "success" } else { "failure" }.to_string()
}

//! Per-request routing: service name resolution, connection reuse and retry.
//!
//! A request moves through `Resolving -> Connecting -> Forwarding` and ends
//! forwarded, failed, or back at `Resolving` after a retry. Connect failures
//! are reported to the producer so repeatedly failing instances drop out of
//! rotation; the retry budget is per inbound request.

use crate::metrics::MetricsRegistry;
use crate::types::ProxyConfig;
use crate::upstream::{Upstream, UpstreamPool};
use bytes::Bytes;
use discovery::{ServiceBroker, ServiceEntity};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap};
use hyper::http::request::Parts;
use hyper::{Request, Response};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Terminal routing failures
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no service name in request path {0:?}")]
    BadRequestRouting(String),

    #[error("no eligible instance for service {0}")]
    NoEligibleInstance(String),

    #[error("retries exhausted for service {service} after {attempts} attempt(s)")]
    RetriesExhausted { service: String, attempts: u32 },

    #[error("upstream error: {0}")]
    Upstream(#[source] BoxError),

    #[error("failed to read request body: {0}")]
    InboundBody(#[source] BoxError),
}

impl RouteError {
    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RouteError::BadRequestRouting(_) => "bad_request_routing",
            RouteError::NoEligibleInstance(_) => "no_eligible_instance",
            RouteError::RetriesExhausted { .. } => "retries_exhausted",
            RouteError::Upstream(_) => "upstream",
            RouteError::InboundBody(_) => "inbound_body",
        }
    }
}

/// Service name from the first path segment of `/{serviceName}/...`
pub fn service_name_from_path(path: &str) -> Option<&str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let name = trimmed.split('/').next().unwrap_or_default();
    if name.is_empty() { None } else { Some(name) }
}

/// Inbound request with its body fully buffered
#[derive(Debug)]
pub struct BufferedRequest {
    parts: Parts,
    body: Bytes,
}

impl BufferedRequest {
    pub fn new(parts: Parts, body: Bytes) -> Self {
        Self { parts, body }
    }

    /// Request path, used for routing
    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    /// Fresh upstream request with the original method, URI and headers
    fn to_upstream(&self) -> Request<Full<Bytes>> {
        let mut request = Request::new(Full::new(self.body.clone()));
        *request.method_mut() = self.parts.method.clone();
        *request.uri_mut() = self.parts.uri.clone();
        *request.headers_mut() = self.parts.headers.clone();
        strip_hop_by_hop(request.headers_mut());
        request
    }
}

/// Routing state for one request
enum RouteState {
    Resolving,
    Connecting(ServiceEntity),
    Forwarding {
        entity: ServiceEntity,
        upstream: Arc<Upstream>,
        reused: bool,
    },
    Retry,
}

/// Routes inbound requests to instances resolved through the broker
pub struct ProxyRouter {
    broker: Arc<ServiceBroker>,
    config: ProxyConfig,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl ProxyRouter {
    pub fn new(broker: Arc<ServiceBroker>, config: ProxyConfig, metrics: Option<Arc<MetricsRegistry>>) -> Self {
        Self {
            broker,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<ServiceBroker> {
        &self.broker
    }

    /// Forward `request` through `pool`, returning the buffered upstream response
    pub async fn route(
        &self,
        pool: &UpstreamPool,
        request: BufferedRequest,
    ) -> Result<Response<Full<Bytes>>, RouteError> {
        let Some(service) = service_name_from_path(request.path()).map(str::to_string) else {
            debug!(path = request.path(), "No service name in request path");
            return Err(RouteError::BadRequestRouting(request.path().to_string()));
        };

        let producer = self.broker.producer().await;
        let mut retries = 0u32;
        let mut state = RouteState::Resolving;

        loop {
            state = match state {
                RouteState::Resolving => {
                    let Some(entity) = producer.produce(&service).await else {
                        self.metric(|m| m.record_resolution(false));
                        debug!(service = %service, "No eligible instance");
                        return Err(RouteError::NoEligibleInstance(service));
                    };
                    self.metric(|m| m.record_resolution(true));

                    match pool.get(&entity.target()) {
                        Some(upstream) => {
                            debug!(service = %service, upstream = upstream.key(), "Reusing upstream connection");
                            self.metric(|m| m.record_reuse());
                            RouteState::Forwarding {
                                entity,
                                upstream,
                                reused: true,
                            }
                        }
                        None => RouteState::Connecting(entity),
                    }
                }

                RouteState::Connecting(entity) => match pool.connect(&entity.target()).await {
                    Ok(upstream) => {
                        self.metric(|m| m.record_connect(true));
                        RouteState::Forwarding {
                            entity,
                            upstream,
                            reused: false,
                        }
                    }
                    Err(e) => {
                        self.metric(|m| m.record_connect(false));
                        warn!(
                            service = %service,
                            instance = %entity.instance_id,
                            upstream = %entity.target(),
                            error = %e,
                            "Upstream connect failed"
                        );
                        producer.report_error(&entity);
                        RouteState::Retry
                    }
                },

                RouteState::Forwarding {
                    entity,
                    upstream,
                    reused,
                } => match upstream.send(request.to_upstream()).await {
                    Ok(response) => return self.buffer_response(response).await,
                    Err(e) if reused => {
                        debug!(
                            service = %service,
                            upstream = upstream.key(),
                            error = %e,
                            "Reused upstream connection failed"
                        );
                        pool.evict(&entity.target());
                        RouteState::Retry
                    }
                    Err(e) => return Err(RouteError::Upstream(e.into())),
                },

                RouteState::Retry => {
                    retries += 1;
                    if retries >= self.config.upstream_retry_max {
                        warn!(service = %service, attempts = retries, "Upstream retries exhausted");
                        return Err(RouteError::RetriesExhausted {
                            service,
                            attempts: retries,
                        });
                    }
                    self.metric(|m| m.record_retry());
                    tokio::time::sleep(self.config.retry_backoff).await;
                    RouteState::Resolving
                }
            };
        }
    }

    async fn buffer_response(&self, response: Response<Incoming>) -> Result<Response<Full<Bytes>>, RouteError> {
        let (mut parts, body) = response.into_parts();
        let body = Limited::new(body, self.config.max_aggregated_bytes)
            .collect()
            .await
            .map_err(RouteError::Upstream)?
            .to_bytes();

        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Full::new(body)))
    }

    fn metric(&self, record: impl FnOnce(&MetricsRegistry)) {
        if let Some(ref m) = self.metrics {
            record(m);
        }
    }
}

/// Read the whole inbound body, bounded by `limit` bytes
///
/// `Ok(None)` means the body exceeded the limit.
pub async fn buffer_request(request: Request<Incoming>, limit: usize) -> Result<Option<BufferedRequest>, RouteError> {
    let (parts, body) = request.into_parts();
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(Some(BufferedRequest::new(parts, collected.to_bytes()))),
        Err(e) if e.is::<http_body_util::LengthLimitError>() => Ok(None),
        Err(e) => Err(RouteError::InboundBody(e)),
    }
}

/// Headers scoped to a single connection, recomputed for the buffered body
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in [
        header::CONNECTION,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::TE,
        header::TRAILER,
        header::PROXY_AUTHORIZATION,
    ] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

//! Proxy server: accept loop and per-connection HTTP/1 serving.

use crate::http_server::MetricsServer;
use crate::metrics::MetricsRegistry;
use crate::router::{ProxyRouter, RouteError, buffer_request};
use crate::types::ProxyConfig;
use crate::upstream::UpstreamPool;
use bytes::Bytes;
use discovery::ServiceBroker;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Discovery-backed reverse proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    router: Arc<ProxyRouter>,
    metrics: Option<Arc<MetricsRegistry>>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    /// Create a new proxy server routing through `broker`
    pub fn new(config: ProxyConfig, broker: Arc<ServiceBroker>) -> Self {
        let metrics = if config.metrics_enabled {
            info!("Metrics enabled on {}", config.metrics_listen_addr);
            Some(Arc::new(MetricsRegistry::new(&config.metrics_duration_buckets)))
        } else {
            info!("Metrics disabled");
            None
        };

        let router = Arc::new(ProxyRouter::new(broker, config.clone(), metrics.clone()));

        Self {
            config,
            router,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Metrics registry, when enabled
    pub fn metrics(&self) -> Option<&Arc<MetricsRegistry>> {
        self.metrics.as_ref()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> common::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> common::Result<()> {
        info!(listen_addr = %listener.local_addr()?, "Proxy server listening");

        let metrics_handle = self.metrics.as_ref().map(|registry| {
            let server = MetricsServer::new(
                registry.clone(),
                self.config.metrics_listen_addr.clone(),
                self.shutdown.clone(),
            );
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    warn!(error = %e, "Metrics server error");
                }
            })
        });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Proxy server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let router = self.router.clone();
                        let metrics = self.metrics.clone();
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(serve_connection(router, stream, peer, metrics, shutdown));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        if let Some(ref m) = self.metrics {
                            m.record_error("accept");
                        }
                    }
                }
            }
        }

        if let Some(handle) = metrics_handle {
            let _ = handle.await;
        }

        info!("Proxy server stopped");
        Ok(())
    }
}

/// Serve one inbound connection; its upstream connections close with it
async fn serve_connection(
    router: Arc<ProxyRouter>,
    stream: TcpStream,
    peer: SocketAddr,
    metrics: Option<Arc<MetricsRegistry>>,
    shutdown: CancellationToken,
) {
    debug!(peer = %peer, "Inbound connection opened");
    if let Some(ref m) = metrics {
        m.connection_opened();
    }

    let pool = Arc::new(UpstreamPool::new(router.config().connect_timeout));
    let service = {
        let pool = pool.clone();
        let metrics = metrics.clone();
        service_fn(move |request| {
            let router = router.clone();
            let pool = pool.clone();
            let metrics = metrics.clone();
            async move { handle_request(&router, &pool, metrics.as_deref(), request).await }
        })
    };

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let mut draining = false;
    let result = loop {
        tokio::select! {
            result = conn.as_mut() => break result,
            _ = shutdown.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    };

    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "Inbound connection closed with error");
        if let Some(ref m) = metrics {
            m.record_error("connection");
        }
    }

    drop(pool);
    if let Some(ref m) = metrics {
        m.connection_closed();
    }
    debug!(peer = %peer, "Inbound connection closed");
}

/// Buffer, route and time one request
///
/// Routing failures are returned as errors, which closes the inbound connection.
async fn handle_request(
    router: &ProxyRouter,
    pool: &UpstreamPool,
    metrics: Option<&MetricsRegistry>,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, RouteError> {
    let started = Instant::now();

    let (outcome, label) = match buffer_request(request, router.config().max_aggregated_bytes).await {
        Ok(Some(buffered)) => {
            let outcome = router.route(pool, buffered).await;
            let label = match &outcome {
                Ok(_) => "forwarded",
                Err(e) => e.kind(),
            };
            (outcome, label)
        }
        Ok(None) => (Ok(payload_too_large()), "payload_too_large"),
        Err(e) => {
            let label = e.kind();
            (Err(e), label)
        }
    };

    if let Err(ref e) = outcome {
        debug!(error = %e, "Request failed");
    }
    if let Some(m) = metrics {
        m.record_request(label, started.elapsed());
    }

    outcome
}

fn payload_too_large() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"Payload Too Large")));
    *response.status_mut() = StatusCode::PAYLOAD_TOO_LARGE;
    response
}

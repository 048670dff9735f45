//! Upstream connection pool owned by one inbound connection.

use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Errors opening an upstream connection
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect to {0} timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] hyper::Error),
}

/// A live HTTP/1 connection to one upstream instance
pub struct Upstream {
    key: String,
    sender: Mutex<SendRequest<Full<Bytes>>>,
    driver: JoinHandle<()>,
}

impl Upstream {
    /// `address:port` this connection targets
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the connection task is still running
    pub fn is_live(&self) -> bool {
        !self.driver.is_finished()
    }

    /// Send one request and wait for the response head
    pub async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>, hyper::Error> {
        let mut sender = self.sender.lock().await;
        sender.ready().await?;
        sender.send_request(request).await
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Connections keyed by `address:port`
///
/// Dropping the pool closes every connection it opened.
pub struct UpstreamPool {
    connections: DashMap<String, Arc<Upstream>>,
    connect_timeout: Duration,
}

impl UpstreamPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            connect_timeout,
        }
    }

    /// Cached live connection for `key`; a dead one is evicted
    pub fn get(&self, key: &str) -> Option<Arc<Upstream>> {
        let upstream = self.connections.get(key).map(|entry| entry.value().clone())?;
        if upstream.is_live() {
            return Some(upstream);
        }

        debug!(upstream = key, "Evicting closed upstream connection");
        self.connections.remove(key);
        None
    }

    /// Open a new connection to `key` and cache it
    pub async fn connect(&self, key: &str) -> Result<Arc<Upstream>, ConnectError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(key))
            .await
            .map_err(|_| ConnectError::Timeout(key.to_string(), self.connect_timeout))??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(upstream = key, error = %e, "Failed to set TCP_NODELAY");
        }

        let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        let target = key.to_string();
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(upstream = %target, error = %e, "Upstream connection ended");
            }
        });

        let upstream = Arc::new(Upstream {
            key: key.to_string(),
            sender: Mutex::new(sender),
            driver,
        });
        self.connections.insert(key.to_string(), upstream.clone());
        debug!(upstream = key, "Opened upstream connection");
        Ok(upstream)
    }

    /// Drop the cached connection for `key`
    pub fn evict(&self, key: &str) -> bool {
        self.connections.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = UpstreamPool::new(Duration::from_secs(1));
        let result = pool.connect(&addr).await;
        assert!(matches!(result, Err(ConnectError::Io(_))));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_connect_caches_and_evicts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let pool = UpstreamPool::new(Duration::from_secs(1));
        let upstream = pool.connect(&addr).await.unwrap();
        assert_eq!(upstream.key(), addr);
        assert!(pool.get(&addr).is_some());
        assert_eq!(pool.len(), 1);

        assert!(pool.evict(&addr));
        assert!(!pool.evict(&addr));
        assert!(pool.get(&addr).is_none());
    }

    #[tokio::test]
    async fn test_closed_connection_is_evicted_on_lookup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let pool = UpstreamPool::new(Duration::from_secs(1));
        let upstream = pool.connect(&addr).await.unwrap();

        for _ in 0..50 {
            if !upstream.is_live() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(!upstream.is_live());
        assert!(pool.get(&addr).is_none());
        assert!(pool.is_empty());
    }
}

//! Coordination store abstraction and the in-process implementation.
//!
//! The directory only ever talks to the store through [`CoordinationStore`].
//! A production deployment plugs in a client for a consensus-backed
//! hierarchical store; [`MemoryStore`] keeps the same semantics inside the
//! process and is what the proxy binary and the tests run against.

use crate::types::SessionSettings;
use async_trait::async_trait;
use common::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the watch event channel
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Change notification delivered to watchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A node was created
    Created { path: String, data: Vec<u8> },
    /// A node was deleted (explicitly or by session expiry)
    Deleted { path: String },
}

/// Primitives the directory needs from a hierarchical, watchable store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Open the session
    async fn connect(&self, settings: &SessionSettings) -> Result<()>;

    /// Create an ephemeral node
    async fn create(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Delete a node
    async fn delete(&self, path: &str) -> Result<()>;

    /// Names of the immediate children of `path`
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Data stored at `path`
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Subscribe to node changes
    fn watch(&self) -> broadcast::Receiver<StoreEvent>;

    /// Release the session
    async fn close(&self);
}

/// In-process coordination store
pub struct MemoryStore {
    nodes: DashMap<String, Vec<u8>>,
    events: broadcast::Sender<StoreEvent>,
    connected: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            nodes: DashMap::new(),
            events,
            connected: AtomicBool::new(false),
        }
    }

    /// Remove a node as if its owning session had expired
    pub fn expire(&self, path: &str) -> bool {
        if self.nodes.remove(path).is_some() {
            debug!(path, "Node expired");
            let _ = self.events.send(StoreEvent::Deleted {
                path: path.to_string(),
            });
            true
        } else {
            false
        }
    }

    /// Insert raw node data, bypassing the session (used to seed foreign records)
    pub fn put_raw(&self, path: &str, data: Vec<u8>) {
        self.nodes.insert(path.to_string(), data.clone());
        let _ = self.events.send(StoreEvent::Created {
            path: path.to_string(),
            data,
        });
    }

    /// Number of stored nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the store holds no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::store("session is not connected"))
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn connect(&self, settings: &SessionSettings) -> Result<()> {
        info!(
            connect_string = %settings.connect_string,
            session_timeout_ms = settings.session_timeout.as_millis() as u64,
            connection_timeout_ms = settings.connection_timeout.as_millis() as u64,
            "In-memory coordination store connected"
        );
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn create(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.ensure_connected()?;
        match self.nodes.entry(path.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::store(format!("node already exists: {}", path)))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(data.clone());
                let _ = self.events.send(StoreEvent::Created {
                    path: path.to_string(),
                    data,
                });
                Ok(())
            }
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.ensure_connected()?;
        if self.nodes.remove(path).is_none() {
            return Err(Error::store(format!("no node: {}", path)));
        }
        let _ = self.events.send(StoreEvent::Deleted {
            path: path.to_string(),
        });
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.ensure_connected()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut names: Vec<String> = self
            .nodes
            .iter()
            .filter_map(|entry| {
                let rest = entry.key().strip_prefix(&prefix)?;
                rest.split('/').next().map(str::to_string)
            })
            .filter(|name| !name.is_empty())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_connected()?;
        Ok(self.nodes.get(path).map(|entry| entry.value().clone()))
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            info!("In-memory coordination store closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> SessionSettings {
        SessionSettings {
            connect_string: "memory".to_string(),
            session_timeout: Duration::from_secs(3),
            connection_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_operations_require_session() {
        let store = MemoryStore::new();
        assert!(store.create("/a/b", vec![1]).await.is_err());
        assert!(store.children("/a").await.is_err());

        store.connect(&settings()).await.unwrap();
        assert!(store.create("/a/b", vec![1]).await.is_ok());

        store.close().await;
        assert!(store.get("/a/b").await.is_err());
    }

    #[tokio::test]
    async fn test_children_lists_immediate_names() {
        let store = MemoryStore::new();
        store.connect(&settings()).await.unwrap();

        store.create("/base/svc-a/1", vec![]).await.unwrap();
        store.create("/base/svc-a/2", vec![]).await.unwrap();
        store.create("/base/svc-b/3", vec![]).await.unwrap();
        store.create("/other/svc-c/4", vec![]).await.unwrap();

        assert_eq!(store.children("/base").await.unwrap(), vec!["svc-a", "svc-b"]);
        assert_eq!(store.children("/base/svc-a").await.unwrap(), vec!["1", "2"]);
        assert!(store.children("/missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_delete_missing() {
        let store = MemoryStore::new();
        store.connect(&settings()).await.unwrap();

        store.create("/base/svc/1", vec![1]).await.unwrap();
        assert!(store.create("/base/svc/1", vec![2]).await.is_err());
        assert_eq!(store.get("/base/svc/1").await.unwrap(), Some(vec![1]));

        store.delete("/base/svc/1").await.unwrap();
        assert!(store.delete("/base/svc/1").await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_watch_delivers_events() {
        let store = MemoryStore::new();
        store.connect(&settings()).await.unwrap();
        let mut events = store.watch();

        store.create("/base/svc/1", vec![7]).await.unwrap();
        assert!(store.expire("/base/svc/1"));
        assert!(!store.expire("/base/svc/1"));

        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::Created {
                path: "/base/svc/1".to_string(),
                data: vec![7]
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::Deleted {
                path: "/base/svc/1".to_string()
            }
        );
    }
}

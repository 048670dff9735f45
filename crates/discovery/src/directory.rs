//! In-memory view of registered instances, synchronized with the
//! coordination store.
//!
//! Nodes live at `{base_path}/{service_name}/{instance_id}`. With
//! `watch_instances` enabled the directory keeps a per-service snapshot that
//! a background task patches from the store's event stream; otherwise every
//! query reads the store.
//!
//! Operations hold the session read guard for their whole duration, so
//! [`InstanceDirectory::close`] waits for in-flight calls and everything
//! issued afterwards sees a stopped directory.

use crate::store::{CoordinationStore, StoreEvent};
use crate::types::{DiscoveryConfig, InstanceId, ServiceDescriptor, ServiceInstance};
use common::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

type Snapshots = Arc<DashMap<String, Vec<Arc<ServiceInstance>>>>;

/// Live session state
struct Session {
    watcher: Option<JoinHandle<()>>,
}

/// Directory of service instances
pub struct InstanceDirectory {
    store: Arc<dyn CoordinationStore>,
    config: DiscoveryConfig,
    base_path: String,
    session: RwLock<Option<Session>>,

    /// Instances registered through this directory
    registered: DashMap<InstanceId, Arc<ServiceInstance>>,

    /// Watch-driven snapshots by service name
    snapshots: Snapshots,
}

impl InstanceDirectory {
    /// Create a stopped directory
    pub fn new(config: DiscoveryConfig, store: Arc<dyn CoordinationStore>) -> Self {
        let base_path = normalize_base_path(&config.base_path);
        Self {
            store,
            config,
            base_path,
            session: RwLock::new(None),
            registered: DashMap::new(),
            snapshots: Arc::new(DashMap::new()),
        }
    }

    /// Base path all nodes are stored under
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Start the directory.
    ///
    /// Exactly one initialization runs under concurrent first use; later
    /// calls return immediately. A failed start leaves the directory stopped.
    pub async fn start(&self) -> Result<()> {
        if self.session.read().await.is_some() {
            return Ok(());
        }

        let mut session = self.session.write().await;
        if session.is_some() {
            return Ok(());
        }

        self.store.connect(&self.config.session_settings()).await?;

        let watcher = if self.config.watch_instances {
            // Subscribe before priming so nothing falls between the two.
            let events = self.store.watch();
            reload_snapshots(self.store.as_ref(), &self.base_path, &self.snapshots).await;
            Some(tokio::spawn(watch_loop(
                self.store.clone(),
                self.base_path.clone(),
                self.snapshots.clone(),
                events,
            )))
        } else {
            None
        };

        *session = Some(Session { watcher });
        info!(
            base_path = %self.base_path,
            watch = self.config.watch_instances,
            "Instance directory started"
        );
        Ok(())
    }

    /// Whether the directory has a live session
    pub async fn is_started(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Register an instance built from `descriptor`.
    ///
    /// Returns the new instance id, or `None` if the directory is stopped or
    /// the store rejected the node. No local state is kept on failure.
    pub async fn register(&self, descriptor: &ServiceDescriptor) -> Option<InstanceId> {
        let session = self.session.read().await;
        if session.is_none() {
            warn!(service = %descriptor.name, "Register on stopped directory");
            return None;
        }

        if descriptor.name.is_empty() || descriptor.name.contains('/') {
            warn!(service = %descriptor.name, "Invalid service name");
            return None;
        }

        let instance = ServiceInstance::from_descriptor(descriptor);
        let path = self.instance_path(&instance.name, &instance.id);

        let data = match serde_json::to_vec(&instance) {
            Ok(data) => data,
            Err(e) => {
                warn!(service = %instance.name, error = %e, "Failed to encode instance");
                return None;
            }
        };

        if let Err(e) = self.store.create(&path, data).await {
            warn!(service = %instance.name, path = %path, error = %e, "Failed to register instance");
            return None;
        }

        info!(service = %instance.name, id = %instance.id, target = %instance.target(), "Registered instance");
        let instance = Arc::new(instance);
        if self.config.watch_instances {
            // Visible to queries now; the watch event for this node is a no-op.
            let mut snapshot = self.snapshots.entry(instance.name.clone()).or_default();
            snapshot.retain(|i| i.id != instance.id);
            snapshot.push(instance.clone());
            sort_instances(&mut snapshot);
        }
        let id = instance.id.clone();
        self.registered.insert(id.clone(), instance);
        Some(id)
    }

    /// Unregister an instance previously registered through this directory
    pub async fn unregister(&self, instance_id: &str) -> bool {
        let session = self.session.read().await;
        if session.is_none() {
            return false;
        }

        let Some(instance) = self.registered.get(instance_id).map(|e| e.value().clone()) else {
            debug!(id = instance_id, "Unregister of unknown instance");
            return false;
        };

        let path = self.instance_path(&instance.name, &instance.id);
        if let Err(e) = self.store.delete(&path).await {
            warn!(id = instance_id, path = %path, error = %e, "Failed to unregister instance");
            return false;
        }

        self.registered.remove(instance_id);
        if let Some(mut snapshot) = self.snapshots.get_mut(&instance.name) {
            snapshot.retain(|i| i.id != instance.id);
        }

        info!(service = %instance.name, id = instance_id, "Unregistered instance");
        true
    }

    /// Instances currently known for `service_name`, in stable order.
    ///
    /// Store failures yield an empty snapshot.
    pub async fn query(&self, service_name: &str) -> Vec<Arc<ServiceInstance>> {
        match self.try_query(service_name).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(service = service_name, error = %e, "Instance query failed");
                Vec::new()
            }
        }
    }

    /// Like [`query`](Self::query) but surfaces store failures
    pub async fn try_query(&self, service_name: &str) -> Result<Vec<Arc<ServiceInstance>>> {
        let session = self.session.read().await;
        if session.is_none() {
            return Err(Error::discovery("directory is not started"));
        }

        if self.config.watch_instances {
            return Ok(self
                .snapshots
                .get(service_name)
                .map(|s| s.value().clone())
                .unwrap_or_default());
        }

        read_service(self.store.as_ref(), &self.base_path, service_name).await
    }

    /// Every service name under the base path
    pub async fn query_names(&self) -> Vec<String> {
        let session = self.session.read().await;
        if session.is_none() {
            return Vec::new();
        }

        match self.store.children(&self.base_path).await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Service name query failed");
                Vec::new()
            }
        }
    }

    /// Instance registered through this directory
    pub fn registered(&self, instance_id: &str) -> Option<Arc<ServiceInstance>> {
        self.registered.get(instance_id).map(|e| e.value().clone())
    }

    /// Number of instances registered through this directory
    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    /// Stop the directory and release the store session
    pub async fn close(&self) {
        let mut session = self.session.write().await;
        let Some(state) = session.take() else {
            return;
        };

        if let Some(watcher) = state.watcher {
            watcher.abort();
        }

        // Nodes are owned by this session.
        let paths: Vec<String> = self
            .registered
            .iter()
            .map(|entry| self.instance_path(&entry.name, &entry.id))
            .collect();
        for path in paths {
            if let Err(e) = self.store.delete(&path).await {
                debug!(path = %path, error = %e, "Failed to remove node on close");
            }
        }

        self.registered.clear();
        self.snapshots.clear();
        self.store.close().await;
        info!(base_path = %self.base_path, "Instance directory closed");
    }

    fn instance_path(&self, service_name: &str, instance_id: &str) -> String {
        format!("{}/{}/{}", self.base_path, service_name, instance_id)
    }
}

fn normalize_base_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Read all instances of one service straight from the store
async fn read_service(
    store: &dyn CoordinationStore,
    base_path: &str,
    service_name: &str,
) -> Result<Vec<Arc<ServiceInstance>>> {
    let service_path = format!("{}/{}", base_path, service_name);
    let ids = store.children(&service_path).await?;

    let mut instances = Vec::with_capacity(ids.len());
    for id in ids {
        let path = format!("{}/{}", service_path, id);
        // Nodes may vanish between listing and reading.
        let Some(data) = store.get(&path).await? else {
            continue;
        };
        match serde_json::from_slice::<ServiceInstance>(&data) {
            Ok(instance) => instances.push(Arc::new(instance)),
            Err(e) => warn!(path = %path, error = %e, "Skipping malformed instance record"),
        }
    }

    sort_instances(&mut instances);
    Ok(instances)
}

fn sort_instances(instances: &mut [Arc<ServiceInstance>]) {
    instances.sort_by(|a, b| {
        a.registration_time_utc
            .cmp(&b.registration_time_utc)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Rebuild every snapshot from the store
async fn reload_snapshots(store: &dyn CoordinationStore, base_path: &str, snapshots: &Snapshots) {
    let names = match store.children(base_path).await {
        Ok(names) => names,
        Err(e) => {
            warn!(error = %e, "Failed to list services for snapshot");
            return;
        }
    };

    snapshots.clear();
    for name in names {
        match read_service(store, base_path, &name).await {
            Ok(instances) if !instances.is_empty() => {
                snapshots.insert(name, instances);
            }
            Ok(_) => {}
            Err(e) => warn!(service = %name, error = %e, "Failed to load snapshot"),
        }
    }
    debug!(services = snapshots.len(), "Snapshots reloaded");
}

/// Split `{base}/{name}/{id}` into `(name, id)`
fn parse_instance_path<'a>(base_path: &str, path: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = path.strip_prefix(base_path)?.strip_prefix('/')?;
    let (name, id) = rest.split_once('/')?;
    if name.is_empty() || id.is_empty() || id.contains('/') {
        return None;
    }
    Some((name, id))
}

fn apply_event(base_path: &str, snapshots: &Snapshots, event: StoreEvent) {
    match event {
        StoreEvent::Created { path, data } => {
            let Some((name, _)) = parse_instance_path(base_path, &path) else {
                return;
            };
            let instance = match serde_json::from_slice::<ServiceInstance>(&data) {
                Ok(instance) => Arc::new(instance),
                Err(e) => {
                    warn!(path = %path, error = %e, "Skipping malformed instance record");
                    return;
                }
            };
            let mut snapshot = snapshots.entry(name.to_string()).or_default();
            snapshot.retain(|i| i.id != instance.id);
            snapshot.push(instance);
            sort_instances(&mut snapshot);
        }
        StoreEvent::Deleted { path } => {
            let Some((name, id)) = parse_instance_path(base_path, &path) else {
                return;
            };
            if let Some(mut snapshot) = snapshots.get_mut(name) {
                snapshot.retain(|i| i.id != id);
            }
            snapshots.remove_if(name, |_, s| s.is_empty());
        }
    }
}

async fn watch_loop(
    store: Arc<dyn CoordinationStore>,
    base_path: String,
    snapshots: Snapshots,
    events: broadcast::Receiver<StoreEvent>,
) {
    let mut events = BroadcastStream::new(events);
    while let Some(item) = events.next().await {
        match item {
            Ok(event) => apply_event(&base_path, &snapshots, event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!(missed, "Watch stream lagged, reloading snapshots");
                reload_snapshots(store.as_ref(), &base_path, &snapshots).await;
            }
        }
    }
    debug!("Watch stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MockCoordinationStore};

    fn config(watch: bool) -> DiscoveryConfig {
        DiscoveryConfig {
            base_path: "/test".to_string(),
            watch_instances: watch,
            ..DiscoveryConfig::default()
        }
    }

    #[test]
    fn test_parse_instance_path() {
        assert_eq!(parse_instance_path("/base", "/base/svc/abc"), Some(("svc", "abc")));
        assert_eq!(parse_instance_path("/base", "/base/svc"), None);
        assert_eq!(parse_instance_path("/base", "/other/svc/abc"), None);
        assert_eq!(parse_instance_path("/base", "/base/svc/abc/deeper"), None);
        assert_eq!(parse_instance_path("/base", "/basement/svc/abc"), None);
    }

    #[test]
    fn test_normalize_base_path() {
        assert_eq!(normalize_base_path("/a/b/"), "/a/b");
        assert_eq!(normalize_base_path("a"), "/a");
    }

    #[tokio::test]
    async fn test_register_requires_start() {
        let directory = InstanceDirectory::new(config(false), Arc::new(MemoryStore::new()));
        assert!(directory.register(&ServiceDescriptor::default()).await.is_none());
        assert!(!directory.unregister("missing").await);
        assert!(directory.try_query("nameless").await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_start_connects_once() {
        let mut store = MockCoordinationStore::new();
        store.expect_connect().times(1).returning(|_| Ok(()));
        let directory = Arc::new(InstanceDirectory::new(config(false), Arc::new(store)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let directory = directory.clone();
                tokio::spawn(async move { directory.start().await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert!(directory.is_started().await);
    }

    #[tokio::test]
    async fn test_failed_start_can_be_retried() {
        let mut store = MockCoordinationStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::store("connection refused")));
        store
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let directory = InstanceDirectory::new(config(false), Arc::new(store));

        assert!(directory.start().await.is_err());
        assert!(!directory.is_started().await);
        assert!(directory.start().await.is_ok());
        assert!(directory.is_started().await);
    }

    #[tokio::test]
    async fn test_store_failure_on_register_keeps_no_state() {
        let mut store = MockCoordinationStore::new();
        store.expect_connect().returning(|_| Ok(()));
        store
            .expect_create()
            .returning(|_, _| Err(Error::store("session expired")));
        let directory = InstanceDirectory::new(config(false), Arc::new(store));
        directory.start().await.unwrap();

        let id = directory
            .register(&ServiceDescriptor::named("svc", serde_json::json!("payload")))
            .await;
        assert!(id.is_none());
        assert_eq!(directory.registered_count(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_on_unregister_keeps_state() {
        let mut store = MockCoordinationStore::new();
        store.expect_connect().returning(|_| Ok(()));
        store.expect_create().returning(|_, _| Ok(()));
        store
            .expect_delete()
            .returning(|_| Err(Error::store("connection loss")));
        let directory = InstanceDirectory::new(config(false), Arc::new(store));
        directory.start().await.unwrap();

        let id = directory
            .register(&ServiceDescriptor::named("svc", serde_json::Value::Null))
            .await
            .unwrap();
        assert!(!directory.unregister(&id).await);
        assert!(directory.registered(&id).is_some());
    }

    #[tokio::test]
    async fn test_unknown_unregister_never_touches_store() {
        let mut store = MockCoordinationStore::new();
        store.expect_connect().returning(|_| Ok(()));
        store.expect_delete().never();
        let directory = InstanceDirectory::new(config(false), Arc::new(store));
        directory.start().await.unwrap();

        assert!(!directory.unregister("00000000-0000-0000-0000-000000000000").await);
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let directory = InstanceDirectory::new(config(false), store.clone());
        directory.start().await.unwrap();

        let id = directory
            .register(&ServiceDescriptor::named("svc", serde_json::Value::Null))
            .await
            .unwrap();
        store.put_raw("/test/svc/garbage", b"not json".to_vec());

        let instances = directory.query("svc").await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, id);
    }

    #[tokio::test]
    async fn test_watch_snapshot_follows_external_changes() {
        let store = Arc::new(MemoryStore::new());
        let writer = InstanceDirectory::new(config(false), store.clone());
        let reader = InstanceDirectory::new(config(true), store.clone());
        writer.start().await.unwrap();

        let first = writer
            .register(&ServiceDescriptor::named("svc", serde_json::Value::Null))
            .await
            .unwrap();
        reader.start().await.unwrap();
        assert_eq!(reader.query("svc").await.len(), 1);

        let second = writer
            .register(&ServiceDescriptor::named("svc", serde_json::Value::Null))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(reader.query("svc").await.len(), 2);

        assert!(store.expire(&format!("/test/svc/{}", first)));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let remaining = reader.query("svc").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, second);
    }

    #[tokio::test]
    async fn test_watch_register_is_visible_immediately() {
        let directory = InstanceDirectory::new(config(true), Arc::new(MemoryStore::new()));
        directory.start().await.unwrap();

        let id = directory
            .register(&ServiceDescriptor::named("svc", serde_json::Value::Null))
            .await
            .unwrap();
        let instances = directory.query("svc").await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, id);

        // The watch event for the same node must not duplicate it.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(directory.query("svc").await.len(), 1);

        assert!(directory.unregister(&id).await);
        assert!(directory.query("svc").await.is_empty());
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let store = Arc::new(MemoryStore::new());
        let directory = InstanceDirectory::new(config(true), store.clone());
        directory.start().await.unwrap();
        directory
            .register(&ServiceDescriptor::named("svc", serde_json::Value::Null))
            .await
            .unwrap();

        directory.close().await;
        assert!(!directory.is_started().await);
        assert_eq!(directory.registered_count(), 0);
        assert!(store.is_empty());
        assert!(directory.query("svc").await.is_empty());
        assert!(directory.register(&ServiceDescriptor::default()).await.is_none());
    }
}

//! Registration facade over the instance directory.

use crate::directory::InstanceDirectory;
use crate::types::{InstanceId, ServiceDescriptor};
use futures::future::join_all;
use std::sync::Arc;

/// Registers and unregisters instances
pub struct ServiceRegistry {
    directory: Arc<InstanceDirectory>,
}

impl ServiceRegistry {
    /// Create a registry over `directory`
    pub fn new(directory: Arc<InstanceDirectory>) -> Self {
        Self { directory }
    }

    /// Register one instance; `None` on failure
    pub async fn register(&self, descriptor: &ServiceDescriptor) -> Option<InstanceId> {
        self.directory.register(descriptor).await
    }

    /// Register an instance of `service_name` with default endpoint settings
    pub async fn register_named(&self, service_name: &str, payload: serde_json::Value) -> Option<InstanceId> {
        self.register(&ServiceDescriptor::named(service_name, payload)).await
    }

    /// Register every descriptor; one result per input, in input order
    pub async fn register_all(&self, descriptors: &[ServiceDescriptor]) -> Vec<Option<InstanceId>> {
        join_all(descriptors.iter().map(|d| self.directory.register(d))).await
    }

    /// Unregister one instance
    pub async fn unregister(&self, instance_id: &str) -> bool {
        self.directory.unregister(instance_id).await
    }

    /// Unregister every id; one result per input, in input order
    pub async fn unregister_all<S: AsRef<str>>(&self, instance_ids: &[S]) -> Vec<bool> {
        join_all(instance_ids.iter().map(|id| self.directory.unregister(id.as_ref()))).await
    }
}

//! Resolution facade: lazily creates providers and materializes entities.

use crate::directory::InstanceDirectory;
use crate::provider::{FailureState, ServiceProvider};
use crate::types::{DownInstancePolicy, ServiceEntity, Strategy};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Resolves service names to instances
pub struct ServiceProducer {
    directory: Arc<InstanceDirectory>,
    default_strategy: Strategy,
    policy: DownInstancePolicy,
    providers: DashMap<String, Arc<ServiceProvider>>,
    closed: AtomicBool,
}

impl ServiceProducer {
    /// Create a producer over `directory`
    pub fn new(directory: Arc<InstanceDirectory>, default_strategy: Strategy, policy: DownInstancePolicy) -> Self {
        Self {
            directory,
            default_strategy,
            policy,
            providers: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Strategy used by [`produce`](Self::produce)
    pub fn default_strategy(&self) -> Strategy {
        self.default_strategy
    }

    /// Resolve `service_name` with the default strategy
    pub async fn produce(&self, service_name: &str) -> Option<ServiceEntity> {
        self.produce_with(service_name, self.default_strategy).await
    }

    /// Resolve `service_name` with `strategy`.
    ///
    /// Every failure collapses to `None` plus a log line.
    pub async fn produce_with(&self, service_name: &str, strategy: Strategy) -> Option<ServiceEntity> {
        if self.closed.load(Ordering::Acquire) {
            debug!(service = service_name, "Producer is closed");
            return None;
        }

        let provider = match self.provider(service_name).await {
            Some(provider) => provider,
            None => {
                warn!(
                    service = service_name,
                    path = %format!("{}/{}", self.directory.base_path(), service_name),
                    "No service instance"
                );
                return None;
            }
        };

        match provider.select(strategy).await {
            Some(instance) => Some(ServiceEntity::from(instance.as_ref())),
            None => {
                warn!(service = service_name, %strategy, "No eligible instance");
                None
            }
        }
    }

    /// Feed a failure for `entity` into its provider's circuit breaker
    pub fn report_error(&self, entity: &ServiceEntity) -> bool {
        match self.providers.get(&entity.name) {
            Some(provider) => provider.note_error(&entity.instance_id),
            None => {
                debug!(service = %entity.name, "Error reported for unknown provider");
                false
            }
        }
    }

    /// Failure state of an instance as seen by its provider
    pub fn failure_state(&self, service_name: &str, instance_id: &str) -> Option<FailureState> {
        self.providers.get(service_name)?.failure_state(instance_id)
    }

    /// Whether a provider is cached for `service_name`
    pub fn has_provider(&self, service_name: &str) -> bool {
        self.providers.contains_key(service_name)
    }

    /// Stop serving resolutions and drop all providers
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.providers.clear();
    }

    /// Cached provider, or a fresh one if the directory knows the service.
    ///
    /// A provider that finds no instances is not cached so the next
    /// resolution asks the directory again.
    async fn provider(&self, service_name: &str) -> Option<Arc<ServiceProvider>> {
        if let Some(provider) = self.providers.get(service_name) {
            return Some(provider.clone());
        }

        let provider = Arc::new(ServiceProvider::new(
            service_name,
            self.directory.clone(),
            self.policy,
        ));
        if provider.refresh().await == 0 {
            return None;
        }

        debug!(service = service_name, "Caching new provider");
        Some(
            self.providers
                .entry(service_name.to_string())
                .or_insert(provider)
                .clone(),
        )
    }
}

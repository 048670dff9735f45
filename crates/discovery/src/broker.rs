//! Broker context object tying the directory, producer and registry together.

use crate::directory::InstanceDirectory;
use crate::producer::ServiceProducer;
use crate::registry::ServiceRegistry;
use crate::store::CoordinationStore;
use crate::types::DiscoveryConfig;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

/// Owns the discovery components for one coordination store session
pub struct ServiceBroker {
    config: DiscoveryConfig,
    directory: Arc<InstanceDirectory>,
    registry: ServiceRegistry,
    producer: ServiceProducer,
    closed: AtomicBool,
}

impl ServiceBroker {
    /// Create a broker; nothing connects until a facade is requested
    pub fn new(config: DiscoveryConfig, store: Arc<dyn CoordinationStore>) -> Self {
        let directory = Arc::new(InstanceDirectory::new(config.clone(), store));
        let registry = ServiceRegistry::new(directory.clone());
        let producer = ServiceProducer::new(
            directory.clone(),
            config.provider_strategy,
            config.down_instance_policy,
        );

        Self {
            config,
            directory,
            registry,
            producer,
            closed: AtomicBool::new(false),
        }
    }

    /// Configuration the broker was built with
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Underlying directory
    pub fn directory(&self) -> &Arc<InstanceDirectory> {
        &self.directory
    }

    /// Start the directory if needed. Failures are logged.
    ///
    /// A closed broker stays closed.
    pub async fn start(&self) -> bool {
        if self.is_closed() {
            debug!("Start on closed broker");
            return false;
        }

        match self.directory.start().await {
            Ok(()) if self.is_closed() => {
                // Lost a race with close().
                self.directory.close().await;
                false
            }
            Ok(()) => true,
            Err(e) => {
                error!(
                    connect_string = %self.config.connect_string,
                    error = %e,
                    "Discovery init failed"
                );
                false
            }
        }
    }

    /// Registration facade, starting the directory on first use
    pub async fn registry(&self) -> &ServiceRegistry {
        self.start().await;
        &self.registry
    }

    /// Resolution facade, starting the directory on first use
    pub async fn producer(&self) -> &ServiceProducer {
        self.start().await;
        &self.producer
    }

    /// Human-readable listing of every service and instance
    pub async fn dump_instances(&self) -> String {
        let mut out = String::from("\nList all services and all instances\n");
        if !self.directory.is_started().await {
            return out;
        }

        let names = self.directory.query_names().await;
        let _ = writeln!(out, "Found {} service name(s)", names.len());
        for name in names {
            let instances = self.directory.query(&name).await;
            let _ = writeln!(out, "  {} : {} instance(s)", name, instances.len());
            for instance in instances {
                let _ = writeln!(out, "    {}", instance);
            }
        }
        out
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop resolutions, drop providers and release the store session
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.producer.close();
        self.directory.close().await;
        info!("Service broker closed");
    }
}

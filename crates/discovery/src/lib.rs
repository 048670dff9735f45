//! Service discovery for the discovery proxy.
//!
//! Services register instances in a hierarchical coordination store; the
//! resolution side caches instances per service name, selects one with a
//! load-balancing strategy and keeps failing instances out of rotation.
//!
//! # Components
//!
//! - **InstanceDirectory**: register/unregister/query against the store
//! - **ServiceProvider**: per-service cache, selection and circuit breaker
//! - **ServiceProducer**: lazily creates providers, resolves names to entities
//! - **ServiceRegistry**: single and batch registration
//! - **ServiceBroker**: context object owning all of the above
//!
//! # Example
//!
//! ```no_run
//! use discovery::{DiscoveryConfig, MemoryStore, ServiceBroker, ServiceDescriptor};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let broker = ServiceBroker::new(DiscoveryConfig::default(), Arc::new(MemoryStore::new()));
//!
//! let descriptor = ServiceDescriptor::named("orders", serde_json::json!({"zone": "a"}))
//!     .with_endpoint("10.0.0.5", 8080);
//! let id = broker.registry().await.register(&descriptor).await;
//!
//! if let Some(entity) = broker.producer().await.produce("orders").await {
//!     println!("{} -> {}", entity.instance_id, entity.uri);
//! }
//! # let _ = id;
//! # }
//! ```

pub mod broker;
pub mod directory;
pub mod producer;
pub mod provider;
pub mod registry;
pub mod store;
pub mod strategy;
pub mod types;

pub use broker::ServiceBroker;
pub use directory::InstanceDirectory;
pub use producer::ServiceProducer;
pub use provider::{FailureState, ServiceProvider};
pub use registry::ServiceRegistry;
pub use store::{CoordinationStore, MemoryStore, StoreEvent};
pub use strategy::SelectionState;
pub use types::{
    DiscoveryConfig, DownInstancePolicy, InstanceId, ServiceDescriptor, ServiceEntity,
    ServiceInstance, SessionSettings, Strategy,
};

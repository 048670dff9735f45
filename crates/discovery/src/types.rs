//! Service discovery types and structures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Instance identifier (36-character hyphenated UUID)
pub type InstanceId = String;

/// URI template used when a descriptor does not carry one
pub const DEFAULT_URI_TEMPLATE: &str = "{scheme}://{address}:{port}";

/// Registration input for a service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDescriptor {
    /// Service name
    pub name: String,

    /// Host or IP the instance listens on
    pub address: String,

    /// Plain port
    pub port: u16,

    /// Secure port, if the instance serves TLS
    pub ssl_port: Option<u16>,

    /// URI template, expanded by [`ServiceInstance::build_uri`]
    pub uri_template: Option<String>,

    /// Opaque payload stored with the instance
    pub payload: serde_json::Value,

    /// Whether the instance takes traffic
    pub enabled: bool,
}

impl Default for ServiceDescriptor {
    fn default() -> Self {
        Self {
            name: "nameless".to_string(),
            address: "127.0.0.1".to_string(),
            port: 8080,
            ssl_port: None,
            uri_template: None,
            payload: serde_json::Value::Null,
            enabled: true,
        }
    }
}

impl ServiceDescriptor {
    /// Descriptor with default endpoint settings for `name` carrying `payload`
    pub fn named(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            ..Self::default()
        }
    }

    /// Set the endpoint address and port
    pub fn with_endpoint(mut self, address: impl Into<String>, port: u16) -> Self {
        self.address = address.into();
        self.port = port;
        self
    }
}

/// A registered, addressable instance of a named service.
///
/// Serialized as the node payload stored under
/// `{base_path}/{name}/{id}` in the coordination store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub id: InstanceId,
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_port: Option<u16>,
    pub uri_template: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub enabled: bool,
    #[serde(rename = "registrationTimeUTC")]
    pub registration_time_utc: u64,
}

impl ServiceInstance {
    /// Build an instance from a descriptor, assigning a fresh id and the
    /// current registration time.
    pub fn from_descriptor(descriptor: &ServiceDescriptor) -> Self {
        let uri_template = descriptor
            .uri_template
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_URI_TEMPLATE)
            .to_string();

        Self {
            id: Uuid::new_v4().to_string(),
            name: descriptor.name.clone(),
            address: descriptor.address.clone(),
            port: descriptor.port,
            ssl_port: descriptor.ssl_port,
            uri_template,
            payload: descriptor.payload.clone(),
            enabled: descriptor.enabled,
            registration_time_utc: now_utc_millis(),
        }
    }

    /// `address:port` key used for upstream connections
    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Expand the URI template with this instance's fields
    pub fn build_uri(&self) -> String {
        let scheme = if self.ssl_port.is_some() { "https" } else { "http" };
        let port = self.ssl_port.unwrap_or(self.port);
        let ssl_port = self.ssl_port.map(|p| p.to_string()).unwrap_or_default();

        self.uri_template
            .replace("{scheme}", scheme)
            .replace("{name}", &self.name)
            .replace("{id}", &self.id)
            .replace("{address}", &self.address)
            .replace("{ssl-port}", &ssl_port)
            .replace("{port}", &port.to_string())
            .replace(
                "{registration-time-utc}",
                &self.registration_time_utc.to_string(),
            )
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}:{} enabled={} registered={}",
            self.name, self.id, self.address, self.port, self.enabled, self.registration_time_utc
        )
    }
}

/// Fully materialized result of a resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntity {
    pub instance_id: InstanceId,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub ssl_port: Option<u16>,
    pub uri: String,
    pub enabled: bool,
    pub registered_utc: u64,
    pub payload: serde_json::Value,
}

impl ServiceEntity {
    /// `address:port` key used for upstream connections
    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl From<&ServiceInstance> for ServiceEntity {
    fn from(instance: &ServiceInstance) -> Self {
        Self {
            instance_id: instance.id.clone(),
            name: instance.name.clone(),
            address: instance.address.clone(),
            port: instance.port,
            ssl_port: instance.ssl_port,
            uri: instance.build_uri(),
            enabled: instance.enabled,
            registered_utc: instance.registration_time_utc,
            payload: instance.payload.clone(),
        }
    }
}

/// Instance selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
    Sticky,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::RoundRobin => write!(f, "round_robin"),
            Strategy::Random => write!(f, "random"),
            Strategy::Sticky => write!(f, "sticky"),
        }
    }
}

impl FromStr for Strategy {
    type Err = common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "roundrobin" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            "sticky" => Ok(Strategy::Sticky),
            other => Err(common::Error::config(format!("unknown strategy: {}", other))),
        }
    }
}

impl TryFrom<String> for Strategy {
    type Error = common::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Circuit-breaker parameters for failing instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownInstancePolicy {
    /// Errors before an instance is marked down
    pub error_threshold: u32,

    /// How long a down instance stays excluded
    #[serde(with = "humantime_serde")]
    pub down_timeout: Duration,
}

impl Default for DownInstancePolicy {
    fn default() -> Self {
        Self {
            error_threshold: 2,
            down_timeout: Duration::from_secs(30),
        }
    }
}

/// Settings handed to the coordination store when opening a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub connect_string: String,
    pub session_timeout: Duration,
    pub connection_timeout: Duration,
}

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Coordination service address
    pub connect_string: String,

    /// Session timeout (clamped to at least 3s)
    pub session_timeout: Duration,

    /// Connection timeout (clamped to at least 2s)
    pub connection_timeout: Duration,

    /// Root path for all service nodes
    pub base_path: String,

    /// Keep a watch-driven snapshot instead of reading the store per query
    pub watch_instances: bool,

    /// Strategy used by `produce` when none is given
    pub provider_strategy: Strategy,

    /// Circuit breaker settings for providers
    pub down_instance_policy: DownInstancePolicy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            connect_string: "127.0.0.1:2181".to_string(),
            session_timeout: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(50),
            base_path: "/outlinc-discovery".to_string(),
            watch_instances: false,
            provider_strategy: Strategy::RoundRobin,
            down_instance_policy: DownInstancePolicy::default(),
        }
    }
}

impl DiscoveryConfig {
    /// Session settings with the minimum timeouts applied
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            connect_string: self.connect_string.clone(),
            session_timeout: self.session_timeout.max(Duration::from_millis(3000)),
            connection_timeout: self.connection_timeout.max(Duration::from_millis(2000)),
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn now_utc_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

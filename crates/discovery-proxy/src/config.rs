//! Configuration loading and validation for the discovery proxy

use crate::types::ProxyConfig;
use discovery::{DiscoveryConfig, DownInstancePolicy, ServiceDescriptor, Strategy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub proxy: ProxySettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub telemetry: TelemetrySettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    /// Instances registered at startup
    #[serde(default)]
    pub static_instances: Vec<ServiceDescriptor>,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.discovery.validate()?;
        self.proxy.validate()?;
        Ok(())
    }
}

/// Coordination store and resolution settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DiscoverySettings {
    pub connect_string: String,

    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,

    #[validate(custom = "validate_base_path")]
    pub base_path: String,

    pub watch_instances: bool,

    pub provider_strategy: Strategy,

    #[validate(range(min = 1))]
    pub down_instance_threshold: u32,

    #[serde(with = "humantime_serde")]
    pub down_instance_timeout: Duration,
}

/// Proxy listener and upstream settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProxySettings {
    pub host: String,

    #[validate(range(min = 1))]
    pub port: u16,

    #[validate(range(min = 1, max = 100))]
    pub upstream_retry_max: u32,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_retry_backoff")]
    pub retry_backoff: Duration,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[validate(range(min = 1, max = 1048576))]
    pub max_aggregated_kb: usize,
}

/// Prometheus endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub listen_addr: String,
}

/// OTLP export protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    Http,
}

/// OpenTelemetry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub service_name: String,
    pub otlp_endpoint: String,
    pub protocol: OtlpProtocol,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

// Default implementations

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            connect_string: "127.0.0.1:2181".to_string(),
            session_timeout: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(50),
            base_path: "/outlinc-discovery".to_string(),
            watch_instances: false,
            provider_strategy: Strategy::RoundRobin,
            down_instance_threshold: 2,
            down_instance_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            upstream_retry_max: 3,
            retry_backoff: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            max_aggregated_kb: 512,
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9102".to_string(),
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: "discovery-proxy".to_string(),
            otlp_endpoint: "http://localhost:4317".to_string(),
            protocol: OtlpProtocol::Grpc,
        }
    }
}

impl LoggingSettings {
    /// Configured level, `info` when unset
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }

    /// Whether log lines are emitted as JSON
    pub fn is_json(&self) -> bool {
        self.format
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case("json"))
    }
}

// Custom validators

fn validate_base_path(path: &str) -> Result<(), ValidationError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new("base_path_empty"));
    }

    if !trimmed.starts_with('/') {
        return Err(ValidationError::new("base_path_not_absolute"));
    }

    Ok(())
}

fn validate_retry_backoff(backoff: &Duration) -> Result<(), ValidationError> {
    let millis = backoff.as_millis();
    if millis < 1 || millis > 10_000 {
        return Err(ValidationError::new("retry_backoff_out_of_range"));
    }
    Ok(())
}

// Configuration loading implementation

impl Config {
    /// Load configuration from an explicit path, or the default search paths
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            tracing::info!("Loading configuration from: {}", path.display());
            return Self::load_from_file(path);
        }

        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate YAML text
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/discovery-proxy/discovery-proxy.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./discovery-proxy.yaml"));

        paths.into_iter().find(|p: &PathBuf| p.exists() && p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/discovery-proxy/discovery-proxy.yaml"))
    }

    /// Convert to the discovery crate's configuration
    pub fn to_discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            connect_string: self.discovery.connect_string.clone(),
            session_timeout: self.discovery.session_timeout,
            connection_timeout: self.discovery.connection_timeout,
            base_path: self.discovery.base_path.clone(),
            watch_instances: self.discovery.watch_instances,
            provider_strategy: self.discovery.provider_strategy,
            down_instance_policy: DownInstancePolicy {
                error_threshold: self.discovery.down_instance_threshold,
                down_timeout: self.discovery.down_instance_timeout,
            },
        }
    }

    /// Convert to the proxy runtime settings
    pub fn to_proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            host: self.proxy.host.clone(),
            port: self.proxy.port,
            upstream_retry_max: self.proxy.upstream_retry_max,
            retry_backoff: self.proxy.retry_backoff,
            connect_timeout: self.proxy.connect_timeout,
            max_aggregated_bytes: self.proxy.max_aggregated_kb * 1024,
            metrics_enabled: self.metrics.enabled,
            metrics_listen_addr: self.metrics.listen_addr.clone(),
            ..ProxyConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_valid_yaml_parsing() {
        let yaml = r#"
discovery:
  connect_string: "zk1:2181,zk2:2181"
  base_path: "/services"
  watch_instances: true
  provider_strategy: sticky
  down_instance_threshold: 5

proxy:
  port: 9000
  upstream_retry_max: 4
  max_aggregated_kb: 64

metrics:
  enabled: true
  listen_addr: "0.0.0.0:9200"

telemetry:
  enabled: true
  protocol: http
  otlp_endpoint: "http://collector:4318/v1/traces"

logging:
  level: debug
  format: json
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.discovery.connect_string, "zk1:2181,zk2:2181");
        assert_eq!(config.discovery.base_path, "/services");
        assert!(config.discovery.watch_instances);
        assert_eq!(config.discovery.provider_strategy, Strategy::Sticky);
        assert_eq!(config.discovery.down_instance_threshold, 5);
        assert_eq!(config.proxy.port, 9000);
        assert_eq!(config.proxy.upstream_retry_max, 4);
        assert!(config.metrics.enabled);
        assert_eq!(config.telemetry.protocol, OtlpProtocol::Http);
        assert_eq!(config.logging.level(), "debug");
        assert!(config.logging.is_json());
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
proxy:
  port: 8090
"#;

        let config = Config::from_yaml(yaml).unwrap();
        // Should use default values
        assert_eq!(config.proxy.host, "0.0.0.0");
        assert_eq!(config.proxy.retry_backoff, Duration::from_millis(100));
        assert_eq!(config.proxy.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.discovery.session_timeout, Duration::from_secs(60));
        assert_eq!(config.discovery.base_path, "/outlinc-discovery");
        assert!(!config.telemetry.enabled);
        assert_eq!(config.logging.level(), "info");
        assert!(!config.logging.is_json());
        assert!(config.static_instances.is_empty());
    }

    #[test]
    fn test_static_instances_parsing() {
        let yaml = r#"
static_instances:
  - name: orders
    address: 10.0.0.5
    port: 8080
    payload: {zone: a}
  - name: billing
    port: 9090
    enabled: false
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.static_instances.len(), 2);
        assert_eq!(config.static_instances[0].name, "orders");
        assert_eq!(config.static_instances[0].address, "10.0.0.5");
        assert_eq!(config.static_instances[0].payload["zone"], "a");
        assert_eq!(config.static_instances[1].address, "127.0.0.1");
        assert!(!config.static_instances[1].enabled);
    }

    #[test]
    fn test_invalid_retry_max() {
        let yaml = r#"
proxy:
  upstream_retry_max: 0  # Invalid: < 1
"#;
        assert!(Config::from_yaml(yaml).is_err());

        let yaml = r#"
proxy:
  upstream_retry_max: 101  # Invalid: > 100
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_retry_backoff() {
        let yaml = r#"
proxy:
  retry_backoff: 0ms  # Invalid: < 1ms
"#;
        assert!(Config::from_yaml(yaml).is_err());

        let yaml = r#"
proxy:
  retry_backoff: 15s  # Invalid: > 10s
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_aggregated_size() {
        let yaml = r#"
proxy:
  max_aggregated_kb: 0
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_threshold_and_port() {
        let yaml = r#"
discovery:
  down_instance_threshold: 0
"#;
        assert!(Config::from_yaml(yaml).is_err());

        let yaml = r#"
proxy:
  port: 0
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_strategy_parsed_case_insensitively() {
        for (value, expected) in [
            ("RoundRobin", Strategy::RoundRobin),
            ("round_robin", Strategy::RoundRobin),
            ("RANDOM", Strategy::Random),
            ("Sticky", Strategy::Sticky),
        ] {
            let yaml = format!("discovery:\n  provider_strategy: {}\n", value);
            let config = Config::from_yaml(&yaml).unwrap();
            assert_eq!(config.discovery.provider_strategy, expected, "{}", value);
        }
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let yaml = r#"
discovery:
  provider_strategy: weighted
"#;
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_base_path_validation() {
        assert!(validate_base_path("/outlinc-discovery").is_ok());
        assert!(validate_base_path("/").is_ok());

        assert!(validate_base_path("").is_err());
        assert!(validate_base_path("   ").is_err());
        assert!(validate_base_path("relative/path").is_err());
    }

    #[test]
    fn test_missing_explicit_file() {
        let result = Config::load(Some(Path::new("/nonexistent/discovery-proxy.yaml")));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_config_conversions() {
        let yaml = r#"
discovery:
  down_instance_threshold: 7
  down_instance_timeout: 45s
proxy:
  max_aggregated_kb: 2
metrics:
  enabled: true
"#;
        let config = Config::from_yaml(yaml).unwrap();

        let discovery = config.to_discovery_config();
        assert_eq!(discovery.down_instance_policy.error_threshold, 7);
        assert_eq!(discovery.down_instance_policy.down_timeout, Duration::from_secs(45));
        assert_eq!(discovery.provider_strategy, Strategy::RoundRobin);

        let proxy = config.to_proxy_config();
        assert_eq!(proxy.max_aggregated_bytes, 2048);
        assert_eq!(proxy.upstream_retry_max, 3);
        assert!(proxy.metrics_enabled);
        assert_eq!(proxy.listen_addr(), "0.0.0.0:8081");
    }
}

//! Configuration management for the delta proxy

use crate::error::{DeltaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Providers a backend may be configured with
pub const SUPPORTED_PROVIDERS: &[&str] = &["prometheus"];

/// Top-level proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeltaConfig {
    /// Address the proxy listens on (default: 127.0.0.1:8480)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Log level filter for the tracing subscriber (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Cache store settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Maximum number of concurrent host requests per fan-out (default: 4)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_fetches: usize,

    /// Maximum number of retries for a failed upstream request (default: 2)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Per-attempt upstream timeout in milliseconds (default: 30000)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Backends by name; the name is the first path segment of proxied requests
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,
}

/// Cache store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Entity TTL in seconds (default: 86400 = 1 day)
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Byte cap on stored entities; least recently used entries are evicted past it
    #[serde(default)]
    pub max_size_bytes: Option<usize>,
}

/// One logical upstream backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BackendConfig {
    /// Provider type (default: prometheus)
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Base URLs of the hosts queries fan out to
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Trailing window, in seconds, never cached as complete (default: 0)
    #[serde(default)]
    pub backfill_tolerance_secs: u64,

    /// Labels injected into every series returned by this backend
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Never top up range results with a live point at "now" (default: false)
    #[serde(default)]
    pub fast_forward_disable: bool,
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            max_size_bytes: None,
        }
    }
}

impl BackendConfig {
    pub fn backfill_tolerance(&self) -> Duration {
        Duration::from_secs(self.backfill_tolerance_secs)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if !SUPPORTED_PROVIDERS.contains(&self.provider.as_str()) {
            return Err(DeltaError::ConfigError(format!(
                "backend '{}': unsupported provider '{}', must be one of {:?}",
                name, self.provider, SUPPORTED_PROVIDERS
            )));
        }
        if self.hosts.is_empty() {
            return Err(DeltaError::ConfigError(format!(
                "backend '{}': at least one host is required",
                name
            )));
        }
        for host in &self.hosts {
            if !(host.starts_with("http://") || host.starts_with("https://")) {
                return Err(DeltaError::ConfigError(format!(
                    "backend '{}': host '{}' must be an http(s) URL",
                    name, host
                )));
            }
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_listen_address() -> String {
    "127.0.0.1:8480".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_retries() -> usize {
    2
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_cache_ttl() -> u64 {
    86_400 // 1 day
}

fn default_provider() -> String {
    "prometheus".to_string()
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for DeltaConfig {
    fn default() -> Self {
        DeltaConfig {
            listen_address: default_listen_address(),
            log_level: default_log_level(),
            cache: CacheConfig::default(),
            max_concurrent_fetches: default_max_concurrent(),
            max_retries: default_max_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            backends: HashMap::new(),
            metrics_endpoint: None,
        }
    }
}

impl DeltaConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(DeltaConfig)` if loading and validation succeed
    /// * `Err(DeltaError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            DeltaError::ConfigError(format!("Failed to read config file: {}", e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: DeltaConfig = serde_yaml::from_str(content).map_err(|e| {
            DeltaError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - listen_address must not be empty
    /// - cache.ttl_secs must be > 0
    /// - max_concurrent_fetches must be > 0
    /// - request_timeout_ms must be > 0
    /// - every backend needs a supported provider and at least one http(s) host
    pub fn validate(&self) -> Result<()> {
        if self.listen_address.trim().is_empty() {
            return Err(DeltaError::ConfigError(
                "listen_address must not be empty".to_string(),
            ));
        }

        if self.cache.ttl_secs == 0 {
            return Err(DeltaError::ConfigError(
                "cache.ttl_secs must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_fetches == 0 {
            return Err(DeltaError::ConfigError(
                "max_concurrent_fetches must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout_ms == 0 {
            return Err(DeltaError::ConfigError(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }

        for (name, backend) in &self.backends {
            if name.is_empty() || name.contains('/') {
                return Err(DeltaError::ConfigError(format!(
                    "invalid backend name '{}'",
                    name
                )));
            }
            backend.validate(name)?;
        }

        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Update configuration from another config
    ///
    /// Validates `new_config` first; on error nothing is applied.
    ///
    /// # Returns
    /// * `Ok(ConfigChanges)` - Description of what changed
    /// * `Err(DeltaError)` - If the new configuration is invalid
    pub fn update_from(&mut self, new_config: &DeltaConfig) -> Result<ConfigChanges> {
        new_config.validate()?;

        let mut changes = ConfigChanges::default();

        if self.listen_address != new_config.listen_address {
            changes.listen_address_changed = true;
            self.listen_address = new_config.listen_address.clone();
        }

        if self.log_level != new_config.log_level {
            changes.log_level_changed = true;
            self.log_level = new_config.log_level.clone();
        }

        if self.cache != new_config.cache {
            changes.cache_changed = true;
            self.cache = new_config.cache.clone();
        }

        if self.max_concurrent_fetches != new_config.max_concurrent_fetches {
            changes.max_concurrent_changed = true;
            self.max_concurrent_fetches = new_config.max_concurrent_fetches;
        }

        if self.max_retries != new_config.max_retries {
            changes.max_retries_changed = true;
            self.max_retries = new_config.max_retries;
        }

        if self.request_timeout_ms != new_config.request_timeout_ms {
            changes.request_timeout_changed = true;
            self.request_timeout_ms = new_config.request_timeout_ms;
        }

        if self.backends != new_config.backends {
            changes.backends_changed = true;
            self.backends = new_config.backends.clone();
        }

        if self.metrics_endpoint != new_config.metrics_endpoint {
            changes.metrics_endpoint_changed = true;
            self.metrics_endpoint = new_config.metrics_endpoint.clone();
        }

        Ok(changes)
    }

    /// Reload configuration from file and apply changes
    pub fn reload_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<ConfigChanges> {
        let new_config = Self::from_file(path)?;
        self.update_from(&new_config)
    }
}

/// Description of configuration changes after hot reload
#[derive(Debug, Default, Clone)]
pub struct ConfigChanges {
    pub listen_address_changed: bool,
    pub log_level_changed: bool,
    pub cache_changed: bool,
    pub max_concurrent_changed: bool,
    pub max_retries_changed: bool,
    pub request_timeout_changed: bool,
    pub backends_changed: bool,
    pub metrics_endpoint_changed: bool,
}

impl ConfigChanges {
    /// Check if any changes were made
    pub fn has_changes(&self) -> bool {
        self.listen_address_changed
            || self.log_level_changed
            || self.cache_changed
            || self.max_concurrent_changed
            || self.max_retries_changed
            || self.request_timeout_changed
            || self.backends_changed
            || self.metrics_endpoint_changed
    }

    /// Settings that only take effect after a restart
    ///
    /// Listeners and the cache store are built once at startup.
    pub fn requires_restart(&self) -> bool {
        self.listen_address_changed
            || self.metrics_endpoint_changed
            || self.cache_changed
            || self.log_level_changed
    }

    /// Whether the backend registry must be rebuilt
    pub fn requires_registry_rebuild(&self) -> bool {
        self.backends_changed
            || self.max_concurrent_changed
            || self.max_retries_changed
            || self.request_timeout_changed
    }

    /// Get a summary of changes
    pub fn summary(&self) -> Vec<String> {
        let mut changes = Vec::new();

        if self.listen_address_changed {
            changes.push("listen_address".to_string());
        }
        if self.log_level_changed {
            changes.push("log_level".to_string());
        }
        if self.cache_changed {
            changes.push("cache".to_string());
        }
        if self.max_concurrent_changed {
            changes.push("max_concurrent_fetches".to_string());
        }
        if self.max_retries_changed {
            changes.push("max_retries".to_string());
        }
        if self.request_timeout_changed {
            changes.push("request_timeout_ms".to_string());
        }
        if self.backends_changed {
            changes.push("backends".to_string());
        }
        if self.metrics_endpoint_changed {
            changes.push("metrics_endpoint".to_string());
        }

        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
listen_address: "0.0.0.0:8480"
cache:
  ttl_secs: 600
backends:
  prom:
    hosts: ["http://prom-a:9090", "http://prom-b:9090"]
    backfill_tolerance_secs: 60
    labels:
      region: eu
"#;

    #[test]
    fn test_default_config_is_valid() {
        let config = DeltaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_address, "127.0.0.1:8480");
        assert_eq!(config.cache.ttl_secs, 86_400);
        assert_eq!(config.max_concurrent_fetches, 4);
    }

    #[test]
    fn test_from_yaml() {
        let config = DeltaConfig::from_yaml(SAMPLE).unwrap();
        let prom = &config.backends["prom"];
        assert_eq!(prom.provider, "prometheus");
        assert_eq!(prom.hosts.len(), 2);
        assert_eq!(prom.backfill_tolerance(), Duration::from_secs(60));
        assert_eq!(prom.labels["region"], "eu");
        assert!(!prom.fast_forward_disable);
        assert_eq!(config.max_retries, 2);

        let yaml = "backends:\n  prom:\n    hosts: [\"http://a\"]\n    fast_forward_disable: true\n";
        assert!(DeltaConfig::from_yaml(yaml).unwrap().backends["prom"].fast_forward_disable);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = DeltaConfig::default();
        config.cache.ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = DeltaConfig::default();
        config.backends.insert("prom".to_string(), BackendConfig::default());
        config.backends.get_mut("prom").unwrap().provider = "prometheus".to_string();
        assert!(config.validate().is_err());

        let yaml = "backends:\n  x:\n    provider: influxdb\n    hosts: [\"http://a\"]\n";
        assert!(DeltaConfig::from_yaml(yaml).is_err());

        let yaml = "backends:\n  x:\n    hosts: [\"prom-a:9090\"]\n";
        assert!(DeltaConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_update_from() {
        let mut config = DeltaConfig::from_yaml(SAMPLE).unwrap();
        let mut new_config = config.clone();
        new_config.max_retries = 5;
        new_config
            .backends
            .get_mut("prom")
            .unwrap()
            .hosts
            .push("http://prom-c:9090".to_string());

        let changes = config.update_from(&new_config).unwrap();
        assert!(changes.has_changes());
        assert!(changes.requires_registry_rebuild());
        assert!(!changes.requires_restart());
        assert_eq!(changes.summary(), vec!["max_retries", "backends"]);
        assert_eq!(config, new_config);
    }

    #[test]
    fn test_update_from_invalid_keeps_current() {
        let mut config = DeltaConfig::default();
        let mut bad = config.clone();
        bad.max_concurrent_fetches = 0;
        assert!(config.update_from(&bad).is_err());
        assert_eq!(config.max_concurrent_fetches, 4);
    }
}

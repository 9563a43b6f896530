//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via BUSRPC_CONFIG)
//! 3. Environment variables

use crate::server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default NATS URL.
pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection configuration.
    pub broker: BrokerConfig,
    /// Server runtime configuration.
    pub server: ServerSection,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("BUSRPC_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::ParseError(_, msg) => ConfigError::ParseError(path.to_path_buf(), msg),
            other => other,
        })
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(PathBuf::from("<inline>"), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.broker.apply_env_overrides();
        self.server.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.url.is_empty() {
            return Err(ConfigError::ValidationError(
                "broker.url must not be empty".to_string(),
            ));
        }
        self.server.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// NATS server URL.
    pub url: String,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_NATS_URL.to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl BrokerConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("BUSRPC_NATS_URL") {
            if !url.is_empty() {
                self.url = url;
            }
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Server runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Service subjects to serve.
    pub subjects: Vec<String>,
    /// Queue group shared by server instances (none = every instance gets every request).
    pub queue_group: Option<String>,
    /// Number of worker tasks.
    pub worker_count: usize,
    /// Admission queue length.
    pub queue_len: usize,
    /// Queueing delay after which a warning is logged, in milliseconds.
    pub high_watermark_ms: u64,
    /// Grace period for in-flight requests on stop, in seconds.
    pub stop_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            subjects: vec!["busrpc.diagnostics".to_string()],
            queue_group: None,
            worker_count: 1,
            queue_len: 64,
            high_watermark_ms: 5000,
            stop_timeout_secs: 30,
        }
    }
}

impl ServerSection {
    fn apply_env_overrides(&mut self) {
        if let Ok(subjects) = std::env::var("BUSRPC_SUBJECTS") {
            let parsed: Vec<String> = subjects
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !parsed.is_empty() {
                self.subjects = parsed;
            }
        }

        if let Ok(queue) = std::env::var("BUSRPC_QUEUE_GROUP") {
            self.queue_group = (!queue.is_empty()).then_some(queue);
        }

        if let Ok(workers) = std::env::var("BUSRPC_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.worker_count = n;
            }
        }

        if let Ok(len) = std::env::var("BUSRPC_QUEUE_LEN") {
            if let Ok(n) = len.parse() {
                self.queue_len = n;
            }
        }

        if let Ok(ms) = std::env::var("BUSRPC_HIGH_WATERMARK_MS") {
            if let Ok(n) = ms.parse() {
                self.high_watermark_ms = n;
            }
        }

        if let Ok(secs) = std::env::var("BUSRPC_STOP_TIMEOUT_SECS") {
            if let Ok(n) = secs.parse() {
                self.stop_timeout_secs = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.subjects.is_empty() {
            return Err(ConfigError::ValidationError(
                "server.subjects must list at least one subject".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::ValidationError(
                "server.worker_count must be at least 1".to_string(),
            ));
        }
        if self.queue_len == 0 {
            return Err(ConfigError::ValidationError(
                "server.queue_len must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn high_watermark(&self) -> Duration {
        Duration::from_millis(self.high_watermark_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Builds the runtime configuration for [`Server`](crate::Server).
    pub fn to_server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(self.subjects.clone())
            .with_worker_count(self.worker_count)
            .with_queue_len(self.queue_len)
            .with_high_watermark(self.high_watermark())
            .with_stop_timeout(self.stop_timeout());
        if let Some(queue) = &self.queue_group {
            config = config.with_queue_group(queue.clone());
        }
        config
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("BUSRPC_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(addr) = std::env::var("BUSRPC_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.broker.url, DEFAULT_NATS_URL);
        assert_eq!(config.server.worker_count, 1);
        assert_eq!(config.server.queue_len, 64);
        assert_eq!(config.server.high_watermark(), Duration::from_millis(5000));
        assert_eq!(config.server.stop_timeout(), Duration::from_secs(30));
        assert_eq!(config.metrics.bind_addr.port(), 9090);
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml(
            r#"
server:
  subjects: ["v1.music.Store", "v1.music.Admin"]
  queue_group: store
  worker_count: 8
metrics:
  enabled: true
  bind_addr: "127.0.0.1:9100"
"#,
        )
        .unwrap();
        assert_eq!(config.server.subjects.len(), 2);
        assert_eq!(config.server.queue_group.as_deref(), Some("store"));
        assert_eq!(config.server.worker_count, 8);
        assert_eq!(config.server.queue_len, 64);
        assert_eq!(config.broker.url, DEFAULT_NATS_URL);
        assert_eq!(config.metrics.bind_addr.port(), 9100);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.server.subjects.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.server.worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_server_config() {
        let mut section = ServerSection::default();
        section.queue_group = Some("bar".to_string());
        section.worker_count = 4;
        let server_config = section.to_server_config();
        assert_eq!(server_config.queue_group.as_deref(), Some("bar"));
        assert_eq!(server_config.worker_count, 4);
        assert_eq!(server_config.stop_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.metrics.bind_addr, config.metrics.bind_addr);
        assert_eq!(parsed.server.subjects, config.server.subjects);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busrpc.yaml");
        let mut config = Config::default();
        config.broker.url = "nats://nats.internal:4222".to_string();
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.broker.url, "nats://nats.internal:4222");

        let missing = Config::from_file(dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(ConfigError::IoError(..))));
    }
}

//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Registry used to discover a relay node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Base URL, e.g. `http://registry.example.com:9098`
    pub url: String,
    #[serde(default)]
    pub token: String,
    /// Refuse to fall back to the static server when discovery fails
    #[serde(default)]
    pub must: bool,
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Static relay address, used when no registry answers
    pub server: Option<String>,

    /// Key presented in the authorize request
    pub key: String,

    pub registry: Option<RegistrySettings>,

    /// Layer-2 (TAP) instead of layer-3 (TUN)
    pub tap: bool,

    /// Requested interface name; the OS picks one when unset
    pub device: Option<String>,

    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,

    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub authorize_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub write_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: Some("127.0.0.1:9091".to_string()),
            key: String::new(),
            registry: None,
            tap: false,
            device: None,
            retry_delay: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            authorize_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(3),
        }
    }
}

impl ClientConfig {
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn must_discover(&self) -> bool {
        self.registry.as_ref().map_or(false, |r| r.must)
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.config.server = Some(server.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.config.key = key.into();
        self
    }

    pub fn registry(mut self, registry: RegistrySettings) -> Self {
        self.config.registry = Some(registry);
        self
    }

    pub fn tap(mut self, tap: bool) -> Self {
        self.config.tap = tap;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn authorize_timeout(mut self, timeout: Duration) -> Self {
        self.config.authorize_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

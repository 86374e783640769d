//! Relay node configuration

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Tunnel listen address
    pub listen: SocketAddr,

    /// Key clients must present; empty accepts any key
    pub key: String,

    /// Overlay gateway, clients are leased addresses from `gateway/24`
    pub gateway: Ipv4Addr,

    /// Route manifest served at `GET /routes`
    pub route_file: Option<PathBuf>,

    /// Address of the route manifest HTTP endpoint
    pub http_addr: Option<SocketAddr>,

    /// Host name advertised in the route manifest URL
    pub public_host: Option<String>,

    /// Reverse proxy rule file
    pub reverse_file: Option<PathBuf>,

    /// Accepted but not pushed to clients
    pub nameserver: Option<String>,

    /// Switch ethernet frames instead of IP packets
    pub tap: bool,

    /// Bring up a local TUN/TAP interface at the gateway address
    pub gateway_device: bool,

    /// Name of the gateway interface; the OS picks one when unset
    pub device: Option<String>,

    #[serde(with = "duration_secs")]
    pub authorize_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub write_timeout: Duration,
}

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

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9091)),
            key: String::new(),
            gateway: Ipv4Addr::new(10, 8, 0, 1),
            route_file: None,
            http_addr: None,
            public_host: None,
            reverse_file: None,
            nameserver: None,
            tap: false,
            gateway_device: true,
            device: None,
            authorize_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Empty configured key accepts everything, otherwise exact match
    pub fn accepts_key(&self, key: &str) -> bool {
        self.key.is_empty() || self.key == key
    }
}

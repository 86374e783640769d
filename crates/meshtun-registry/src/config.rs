//! Registry configuration, loaded from YAML
//!
//! ```yaml
//! listen: 0.0.0.0:9098
//! tokens:
//!   - abcdefg
//! nodes:
//!   - id: sg-1
//!     address: 1.2.3.4
//!     port: 9091
//!     windows: true
//!     capacity: 200
//! ```

use crate::selector::{Capabilities, RelayNode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
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
pub struct RegistryConfig {
    pub listen: SocketAddr,
    pub tokens: Vec<String>,
    pub nodes: Vec<NodeConfig>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9098)),
            tokens: Vec::new(),
            nodes: Vec::new(),
        }
    }
}

impl RegistryConfig {
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn relay_nodes(&self) -> Vec<RelayNode> {
        self.nodes.iter().map(NodeConfig::to_relay_node).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub address: String,
    pub port: u16,
    /// Serves Windows TAP-driver clients
    #[serde(default)]
    pub windows: bool,
    #[serde(default)]
    pub tap: bool,
    #[serde(default)]
    pub capacity: Option<u32>,
}

impl NodeConfig {
    pub fn to_relay_node(&self) -> RelayNode {
        let mut capabilities = Capabilities::NONE;
        if self.windows {
            capabilities = capabilities | Capabilities::WINDOWS_DRIVER;
        }
        if self.tap {
            capabilities = capabilities | Capabilities::TAP;
        }

        let mut node = RelayNode::new(&self.id, &self.address, self.port)
            .with_capabilities(capabilities);
        node.capacity = self.capacity;
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
listen: 127.0.0.1:9000
tokens:
  - abcdefg
nodes:
  - id: sg-1
    address: 1.2.3.4
    port: 9091
    windows: true
    capacity: 200
  - id: us-1
    address: 5.6.7.8
    port: 9091
"#;
        let config = RegistryConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.tokens, vec!["abcdefg"]);

        let nodes = config.relay_nodes();
        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].capabilities.contains(Capabilities::WINDOWS_DRIVER));
        assert_eq!(nodes[0].capacity, Some(200));
        assert_eq!(nodes[1].capabilities, Capabilities::NONE);
        assert_eq!(nodes[1].server_address(), "5.6.7.8:9091");
    }

    #[test]
    fn test_defaults_apply() {
        let config = RegistryConfig::from_yaml("tokens: [t1]").unwrap();
        assert_eq!(config.listen, RegistryConfig::default().listen);
        assert!(config.nodes.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.yaml");
        std::fs::write(&path, "listen: 0.0.0.0:7000\n").unwrap();

        let config = RegistryConfig::load(&path).unwrap();
        assert_eq!(config.listen.port(), 7000);

        assert!(matches!(
            RegistryConfig::load(dir.path().join("nope.yaml")),
            Err(ConfigError::Io(_))
        ));
    }
}

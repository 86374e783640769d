//! Relay node registry
//!
//! Answers `POST /tunnel/access` discovery requests: the caller's token is
//! checked against a static set and the least-loaded eligible relay node is
//! handed back as `ip:port`.

pub mod auth;
pub mod config;
pub mod selector;
pub mod server;

pub use auth::{AuthError, StaticTokenValidator, TokenValidator};
pub use config::{ConfigError, NodeConfig, RegistryConfig};
pub use selector::{Capabilities, NodeSelector, RelayNode, SelectError};
pub use server::{build_router, RegistryError, RegistryServer, RegistryState};

//! Tunnel client
//!
//! Connects to a relay node (optionally discovered through the registry),
//! authorizes, and pumps packets between a local virtual interface and the
//! relay until the connection drops, then starts over.

pub mod config;
pub mod discovery;
pub mod interface;
pub mod netconfig;
pub mod routes;
pub mod session;

#[cfg(target_os = "linux")]
pub mod tun;

pub use config::{ClientConfig, ConfigError, RegistrySettings};
pub use discovery::{DiscoveryClient, DiscoveryError, RegistryClient};
pub use interface::{
    system_provider, ChannelHandle, ChannelInterface, ChannelProvider, InterfaceError,
    InterfaceMode, InterfaceProvider, VirtualInterface,
};
pub use netconfig::{NetConfigError, NetworkConfigurator, Platform, ShellCommand, SystemConfigurator};
pub use routes::{apply_routes, fetch_routes, parse_routes, RouteError};
pub use session::{SessionEngine, SessionError, SessionState};

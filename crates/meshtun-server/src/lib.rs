//! Relay node
//!
//! Accepts tunnel clients, leases each an address from `gateway/24` and
//! switches tunnel-data frames between them and the node's own gateway
//! interface. Optionally publishes the route
//! manifest over HTTP and runs the static reverse proxy.

pub mod config;
pub mod gateway;
pub mod pool;
pub mod routes;
pub mod server;
pub mod session;
pub mod switch;

pub use config::{ConfigError, ServerConfig};
pub use gateway::{GatewayError, GatewayInterface};
pub use pool::IpPool;
pub use routes::routes_router;
pub use server::{RelayServer, ServerError};
pub use switch::{SessionId, Switch, SwitchMode};

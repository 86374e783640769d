//! Bidirectional relay engine and static reverse proxy
//!
//! The relay engine copies bytes between two duplex streams until either side
//! finishes. The reverse proxy loads `proto listen->upstream` rules and drives
//! every accepted connection through the engine.

pub mod engine;
pub mod reverse;

pub use engine::{relay, relay_datagrams, RelayError, RelayStats, RELAY_BUFFER_SIZE};
pub use reverse::{
    load_policies, parse_policies, parse_policy_line, ActivePolicy, ProxyLimits, ProxyProtocol,
    ReverseError, ReversePolicy, ReverseProxy,
};

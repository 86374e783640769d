//! Meshtun Protocol Definitions
//!
//! Wire framing shared by the tunnel client and relay nodes, plus the JSON
//! payloads exchanged during authorization and registry discovery.

pub mod codec;
pub mod messages;

pub use codec::{decode, encode, read_frame, CodecError, Command, Frame, FrameCodec};
pub use messages::*;

/// Protocol/client version advertised in authorize requests
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum payload carried by a single frame (64KB)
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Frame header size: length (4) + command (1)
pub const HEADER_SIZE: usize = 5;

/// Registry path answering client discovery requests
pub const ACCESS_PATH: &str = "/tunnel/access";

/// Relay node path serving the route manifest
pub const ROUTES_PATH: &str = "/routes";

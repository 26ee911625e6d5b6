//! devmux Protocol - Wire protocol for daemon communication
//!
//! Clients talk to the daemon over a Unix socket using newline-delimited
//! JSON. Every client message carries the protocol version; the daemon
//! checks it during the `Connect` handshake.

pub mod message;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, DeviceEventKind, MessageType};
pub use version::{ProtocolVersion, VersionError};

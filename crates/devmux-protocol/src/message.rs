//! Protocol message types for daemon communication.

use crate::version::ProtocolVersion;
use devmux_core::{DeviceDescriptor, DeviceId, DevicePath, Mode, SessionId, SessionStatusView};
use serde::{Deserialize, Serialize};

/// Message types that can be sent by clients to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake; authenticates the client and opens (or resumes) a session
    Connect {
        /// Process id of the client, used for ownership checks on resume
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_pid: Option<u32>,
        /// Keep the session and its claims if the transport drops
        #[serde(default)]
        keep_alive: bool,
        /// Reattach to a session retained after a previous disconnect
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_session: Option<SessionId>,
    },

    /// Ask the hardware daemon for a fresh device inventory
    Discover,

    /// Read the current catalog without a hardware round-trip
    ListDevices {
        #[serde(default)]
        unclaimed_only: bool,
    },

    /// Claim a device under an operating mode
    Claim {
        device_id: DeviceId,
        mode: Mode,
        /// Overrides the daemon's default claim timeout
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    /// Release a claimed device
    Release { device_id: DeviceId },

    /// Request this session's status
    Status,

    /// Subscribe to device catalog events
    Subscribe,

    /// Unsubscribe from device catalog events
    Unsubscribe,

    /// Client-initiated liveness check
    Ping { seq: u64 },

    /// Answer to a daemon heartbeat ping
    Pong { seq: u64 },

    /// Acknowledge receipt of `count` daemon messages
    Ack { count: u64 },

    /// Graceful disconnect; releases every claimed device first
    Disconnect,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version
    pub protocol_version: ProtocolVersion,

    /// Message payload
    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    /// Creates a connect message for a fresh session.
    pub fn connect(client_pid: Option<u32>, keep_alive: bool) -> Self {
        Self::new(MessageType::Connect {
            client_pid,
            keep_alive,
            resume_session: None,
        })
    }

    /// Creates a connect message that resumes a retained session.
    pub fn resume(session_id: SessionId, client_pid: Option<u32>) -> Self {
        Self::new(MessageType::Connect {
            client_pid,
            keep_alive: true,
            resume_session: Some(session_id),
        })
    }

    pub fn discover() -> Self {
        Self::new(MessageType::Discover)
    }

    pub fn list_devices(unclaimed_only: bool) -> Self {
        Self::new(MessageType::ListDevices { unclaimed_only })
    }

    pub fn claim(device_id: impl Into<DeviceId>, mode: impl Into<Mode>) -> Self {
        Self::new(MessageType::Claim {
            device_id: device_id.into(),
            mode: mode.into(),
            timeout_ms: None,
        })
    }

    pub fn release(device_id: impl Into<DeviceId>) -> Self {
        Self::new(MessageType::Release {
            device_id: device_id.into(),
        })
    }

    pub fn status() -> Self {
        Self::new(MessageType::Status)
    }

    pub fn subscribe() -> Self {
        Self::new(MessageType::Subscribe)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn pong(seq: u64) -> Self {
        Self::new(MessageType::Pong { seq })
    }

    pub fn ack(count: u64) -> Self {
        Self::new(MessageType::Ack { count })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Kind of change reported in a [`DaemonMessage::DeviceEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEventKind {
    Discovered,
    Claimed,
    Released,
    Disconnected,
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Handshake accepted
    Connected {
        protocol_version: ProtocolVersion,
        session_id: SessionId,
        /// True if an existing session was resumed
        resumed: bool,
    },

    /// Handshake rejected (version mismatch, unknown session, etc.)
    Rejected {
        reason: String,
        /// Daemon's protocol version (for client to upgrade)
        protocol_version: ProtocolVersion,
    },

    /// Device catalog
    DeviceList { devices: Vec<DeviceDescriptor> },

    /// Claim confirmed by the hardware daemon
    Claimed {
        device_id: DeviceId,
        device_path: DevicePath,
        mode: Mode,
    },

    /// Release completed
    Released { device_id: DeviceId },

    /// Session status
    Status { status: Box<SessionStatusView> },

    /// Catalog change pushed to subscribers
    DeviceEvent {
        kind: DeviceEventKind,
        device_id: DeviceId,
        /// Owning session for claim events
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    /// Daemon heartbeat; answer with `Pong`
    Ping { seq: u64 },

    /// Answer to a client `Ping`
    Pong { seq: u64 },

    /// Error response
    Error {
        message: String,
        /// Machine-readable error code (e.g., "conflict", "timeout")
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        /// Device the failed request was about
        #[serde(skip_serializing_if = "Option::is_none")]
        device_id: Option<DeviceId>,
    },
}

impl DaemonMessage {
    pub fn connected(session_id: SessionId, resumed: bool) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            session_id,
            resumed,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn device_list(devices: Vec<DeviceDescriptor>) -> Self {
        Self::DeviceList { devices }
    }

    pub fn claimed(device_id: DeviceId, device_path: DevicePath, mode: Mode) -> Self {
        Self::Claimed {
            device_id,
            device_path,
            mode,
        }
    }

    pub fn released(device_id: DeviceId) -> Self {
        Self::Released { device_id }
    }

    pub fn status(status: SessionStatusView) -> Self {
        Self::Status {
            status: Box::new(status),
        }
    }

    pub fn device_event(kind: DeviceEventKind, device_id: DeviceId, session_id: Option<SessionId>) -> Self {
        Self::DeviceEvent {
            kind,
            device_id,
            session_id,
        }
    }

    pub fn ping(seq: u64) -> Self {
        Self::Ping { seq }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    /// Creates an error response without a code.
    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
            device_id: None,
        }
    }

    /// Creates an error response tied to a device request.
    pub fn device_error(device_id: DeviceId, code: &str, message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
            device_id: Some(device_id),
        }
    }

    /// Returns true for unsolicited pushes that flow control may withhold.
    pub fn is_push(&self) -> bool {
        matches!(self, Self::DeviceEvent { .. })
    }
}

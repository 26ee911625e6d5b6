//! Outbound interface to the hardware daemon.
//!
//! The hardware daemon owns the real transport to the input devices. devmuxd
//! talks to it through [`DeviceBackend`]: each request method returns once
//! the request has been handed to the transport, and the hardware daemon's
//! answers come back later as [`BackendEvent`]s on an mpsc channel that the
//! [`ResourceDaemon`](crate::daemon::ResourceDaemon) drains.
//!
//! ```text
//!  ClientSession ──claim_device()──▶ DeviceBackend ──▶ hardware daemon
//!        ▲                                                   │
//!        │ on_claim_confirmed()                              │
//!  ResourceDaemon ◀──────── BackendEvent (mpsc) ─────────────┘
//! ```

mod loopback;

pub use loopback::{LoopbackBackend, ERR_DEVICE_BUSY, ERR_UNKNOWN_DEVICE, ERR_UNSUPPORTED_MODE};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use devmux_core::{DeviceDescriptor, DeviceId, Mode, SessionId};

/// Requests devmuxd sends to the hardware daemon.
///
/// An `Err` means the request never reached the hardware daemon; the
/// outcome of a request that did reach it arrives as a [`BackendEvent`].
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Ask for a fresh inventory; answered by `BackendEvent::DeviceListUpdated`.
    async fn request_discovery(&self) -> Result<(), BackendError>;

    /// Ask for exclusive access; answered by `BackendEvent::ClaimConfirmed`.
    async fn claim_device(&self, session_id: &SessionId, device_id: &DeviceId, mode: &Mode)
        -> Result<(), BackendError>;

    /// Give a device back; answered by `BackendEvent::ReleaseConfirmed`.
    async fn release_device(&self, session_id: &SessionId, device_id: &DeviceId) -> Result<(), BackendError>;
}

/// Inbound notifications from the hardware daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Current device inventory
    DeviceListUpdated(Vec<DeviceDescriptor>),

    /// Outcome of a claim request
    ClaimConfirmed {
        session_id: SessionId,
        device_id: DeviceId,
        response: ClaimResponse,
    },

    /// A release request was processed
    ReleaseConfirmed {
        session_id: SessionId,
        device_id: DeviceId,
    },

    /// The hardware connection for a device dropped
    DeviceDisconnected { device_id: DeviceId },
}

/// Hardware daemon answer to a claim request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClaimResponse {
    /// Non-zero when the hardware daemon refused the claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ClaimResponse {
    /// A successful grant.
    pub fn granted() -> Self {
        Self::default()
    }

    /// A refusal carrying the hardware daemon's error code.
    pub fn rejected(code: u32, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(code),
            message: Some(message.into()),
        }
    }

    pub fn is_granted(&self) -> bool {
        self.error_code.map_or(true, |code| code == 0)
    }
}

/// Transport-level failure talking to the hardware daemon.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("hardware daemon transport error: {0}")]
    Transport(String),

    #[error("hardware daemon link closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_response_outcome() {
        assert!(ClaimResponse::granted().is_granted());
        assert!(ClaimResponse {
            error_code: Some(0),
            message: None
        }
        .is_granted());
        assert!(!ClaimResponse::rejected(7, "busy").is_granted());
    }

    #[test]
    fn test_backend_error_display() {
        assert_eq!(
            BackendError::Transport("broken pipe".to_string()).to_string(),
            "hardware daemon transport error: broken pipe"
        );
        assert_eq!(BackendError::Closed.to_string(), "hardware daemon link closed");
    }
}

//! Errors returned by session operations.

use thiserror::Error;

use devmux_core::{DeviceId, Mode};

use crate::backend::BackendError;

/// Failure of a claim, release or discovery.
///
/// `Clone` because one outcome may be delivered to several de-duplicated
/// callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Session is not authenticated, or is disconnecting, closed or in error
    #[error("session state '{flags}' does not allow {operation}")]
    InvalidState { operation: &'static str, flags: String },

    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("device {device_id} does not support mode {mode}")]
    IncompatibleMode { device_id: DeviceId, mode: Mode },

    /// Another session holds the device
    #[error("device {0} is claimed by another session")]
    Conflict(DeviceId),

    #[error("session does not own device {0}")]
    NotOwner(DeviceId),

    /// A release of the device is still in flight
    #[error("device {0} is being released")]
    ReleaseInProgress(DeviceId),

    /// The hardware daemon refused the claim
    #[error("hardware daemon rejected claim on {device_id} (code {code}): {message}")]
    Rejected {
        device_id: DeviceId,
        code: u32,
        message: String,
    },

    #[error("claim on {0} timed out")]
    ClaimTimeout(DeviceId),

    #[error("device discovery timed out")]
    DiscoveryTimeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session terminated")]
    SessionTerminated,
}

impl SessionError {
    /// Stable machine-readable code sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidState { .. } => "invalid_state",
            Self::UnknownDevice(_) => "unknown_device",
            Self::IncompatibleMode { .. } => "incompatible_mode",
            Self::Conflict(_) => "conflict",
            Self::NotOwner(_) => "not_owner",
            Self::ReleaseInProgress(_) => "release_in_progress",
            Self::Rejected { .. } => "rejected",
            Self::ClaimTimeout(_) => "claim_timeout",
            Self::DiscoveryTimeout => "discovery_timeout",
            Self::Transport(_) => "transport",
            Self::SessionTerminated => "session_terminated",
        }
    }

    /// Precondition failures are reported without contacting the hardware
    /// daemon and are never retried.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. }
                | Self::UnknownDevice(_)
                | Self::IncompatibleMode { .. }
                | Self::Conflict(_)
                | Self::NotOwner(_)
                | Self::ReleaseInProgress(_)
        )
    }
}

impl From<BackendError> for SessionError {
    fn from(err: BackendError) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_classes() {
        let conflict = SessionError::Conflict(DeviceId::new("kbd-1"));
        assert_eq!(conflict.code(), "conflict");
        assert!(conflict.is_precondition());

        let timeout = SessionError::ClaimTimeout(DeviceId::new("kbd-1"));
        assert_eq!(timeout.to_string(), "claim on kbd-1 timed out");
        assert!(!timeout.is_precondition());
    }

    #[test]
    fn test_from_backend_error() {
        let err: SessionError = BackendError::Closed.into();
        assert_eq!(err, SessionError::Transport("hardware daemon link closed".to_string()));
    }
}

//! Session identity and status snapshots.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;

/// Unique identifier for a client session.
///
/// Assigned by the daemon when a client completes the handshake
/// (e.g., "session-7"). Survives transport reconnects for keep-alive clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

/// Prefix used for daemon-assigned session IDs.
pub const SESSION_PREFIX: &str = "session-";

impl SessionId {
    /// Creates a new SessionId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates the daemon-assigned id for the n-th accepted session.
    pub fn from_sequence(n: u64) -> Self {
        Self(format!("{SESSION_PREFIX}{n}"))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Point-in-time view of a session for status queries.
///
/// Sent to clients in response to a `Status` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusView {
    pub session_id: SessionId,
    /// Names of the flags currently set (e.g., `["connected", "authenticated"]`)
    pub flags: Vec<String>,
    pub healthy: bool,
    pub claimed_devices: Vec<DeviceId>,
    pub pending_claims: usize,
    pub pending_releases: usize,
    pub messages_sent: u64,
    pub messages_acknowledged: u64,
    pub missed_pongs: u32,
    pub keep_alive: bool,
}

impl SessionStatusView {
    /// Number of devices the session holds.
    pub fn claimed_count(&self) -> usize {
        self.claimed_devices.len()
    }

    /// Returns true if the named flag is set in this snapshot.
    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.iter().any(|f| f == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_sequence() {
        assert_eq!(SessionId::from_sequence(4).as_str(), "session-4");
        assert_eq!(SessionId::from("abc").to_string(), "abc");
    }

    #[test]
    fn test_status_view_helpers() {
        let view = SessionStatusView {
            session_id: SessionId::new("session-1"),
            flags: vec!["connected".to_string(), "has_claimed_resources".to_string()],
            healthy: true,
            claimed_devices: vec![DeviceId::new("kbd-1")],
            pending_claims: 0,
            pending_releases: 0,
            messages_sent: 3,
            messages_acknowledged: 3,
            missed_pongs: 0,
            keep_alive: false,
        };
        assert_eq!(view.claimed_count(), 1);
        assert!(view.has_flag("connected"));
        assert!(!view.has_flag("error_state"));
    }
}

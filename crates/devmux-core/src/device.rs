//! Device identity, operating modes and catalog descriptors.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::session::SessionId;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Opaque identifier of a physical input device (e.g., "kbd-1").
///
/// Assigned by the hardware daemon when it reports its inventory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a new DeviceId without validation.
    ///
    /// The hardware daemon owns the identifier space, so ids reported by it
    /// are trusted. Use [`DeviceId::parse`] for ids typed in by clients.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parses a client-supplied device id.
    ///
    /// Rejects empty ids and ids containing `/`, which would break the
    /// hierarchical [`DevicePath`].
    pub fn parse(id: &str) -> DomainResult<Self> {
        let trimmed = id.trim();
        if trimmed.is_empty() || trimmed.contains('/') {
            return Err(DomainError::InvalidIdentifier {
                kind: "device",
                value: id.to_string(),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An operating profile for a device, drawn from its capability set
/// (e.g., "raw" vs "parsed" input).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mode(String);

impl Mode {
    pub fn new(mode: impl Into<String>) -> Self {
        Self(mode.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Mode {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Hierarchical address of a claimed device, used to route traffic for
/// the device to the owning session.
///
/// Format: `/sessions/<session-id>/devices/<device-id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DevicePath(String);

impl DevicePath {
    /// Builds the path under which `session` holds `device`.
    pub fn for_claim(session: &SessionId, device: &DeviceId) -> Self {
        Self(format!("/sessions/{session}/devices/{device}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Device Type
// ============================================================================

/// Kind of physical input device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Keyboard,
    Hid,
    #[default]
    Other,
}

impl DeviceType {
    /// Returns the lowercase label used in config files and on the wire.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Keyboard => "keyboard",
            Self::Hid => "hid",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for DeviceType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keyboard" | "kbd" => Ok(Self::Keyboard),
            "hid" => Ok(Self::Hid),
            "other" => Ok(Self::Other),
            _ => Err(DomainError::UnknownDeviceType(s.to_string())),
        }
    }
}

// ============================================================================
// Device Descriptor
// ============================================================================

/// Catalog entry for a discovered device.
///
/// Lives in the shared device registry. Created when the hardware daemon
/// pushes its inventory, mutated on claim/release, never owned by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_id: DeviceId,
    pub device_type: DeviceType,
    /// Modes this device can be operated in
    pub capabilities: BTreeSet<Mode>,
    /// Whether some session currently holds the device
    pub claimed: bool,
    /// When the device was first reported
    pub discovered_at: DateTime<Utc>,
}

impl DeviceDescriptor {
    /// Creates an unclaimed descriptor.
    pub fn new<I, M>(device_id: DeviceId, device_type: DeviceType, capabilities: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Mode>,
    {
        Self {
            device_id,
            device_type,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            claimed: false,
            discovered_at: Utc::now(),
        }
    }

    /// Returns true if `mode` is in this device's capability set.
    pub fn supports(&self, mode: &Mode) -> bool {
        self.capabilities.contains(mode)
    }

    /// Checks the descriptor is usable: a device with no modes can never
    /// be claimed.
    pub fn validate(&self) -> DomainResult<()> {
        if self.capabilities.is_empty() {
            return Err(DomainError::NoCapabilities {
                device_id: self.device_id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_parse() {
        assert_eq!(DeviceId::parse(" kbd-1 ").unwrap().as_str(), "kbd-1");
        assert!(DeviceId::parse("").is_err());
        assert!(DeviceId::parse("   ").is_err());
        assert!(DeviceId::parse("usb/kbd").is_err());
    }

    #[test]
    fn test_device_type_from_str() {
        assert_eq!("keyboard".parse::<DeviceType>().unwrap(), DeviceType::Keyboard);
        assert_eq!("HID".parse::<DeviceType>().unwrap(), DeviceType::Hid);
        assert!("joystick".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_descriptor_supports() {
        let desc = DeviceDescriptor::new(DeviceId::new("kbd-1"), DeviceType::Keyboard, ["raw", "parsed"]);
        assert!(desc.supports(&Mode::new("raw")));
        assert!(!desc.supports(&Mode::new("midi")));
        assert!(!desc.claimed);
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_descriptor_without_capabilities_is_invalid() {
        let desc = DeviceDescriptor::new(DeviceId::new("hid-0"), DeviceType::Hid, Vec::<Mode>::new());
        assert!(matches!(desc.validate(), Err(DomainError::NoCapabilities { .. })));
    }

    #[test]
    fn test_device_path_format() {
        let path = DevicePath::for_claim(&SessionId::new("session-3"), &DeviceId::new("kbd-1"));
        assert_eq!(path.as_str(), "/sessions/session-3/devices/kbd-1");
    }

    #[test]
    fn test_device_type_serde() {
        let json = serde_json::to_string(&DeviceType::Hid).unwrap();
        assert_eq!(json, "\"hid\"");
    }
}

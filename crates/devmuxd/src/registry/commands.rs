//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `DeviceEvent`: Events published by the registry for subscribers
//!
//! All types are designed for async message passing and follow the panic-free policy.

use devmux_core::{DeviceDescriptor, DeviceId, Mode, SessionId};
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command uses a oneshot channel for the response, enabling
/// request-response patterns in async code without blocking.
///
/// # Usage
///
/// ```ignore
/// let (tx, rx) = oneshot::channel();
/// registry_tx.send(RegistryCommand::Get {
///     device_id: id,
///     respond_to: tx,
/// }).await?;
/// let device = rx.await?;
/// ```
#[derive(Debug)]
pub enum RegistryCommand {
    /// Merge a device inventory pushed by the hardware daemon.
    ///
    /// Existing entries keep their claimed status; new entries start unclaimed.
    /// Responds with the number of devices that were not known before.
    ///
    /// # Errors
    /// - `RegistryError::RegistryFull` if adding the new devices would exceed capacity
    RecordDiscovered {
        devices: Vec<DeviceDescriptor>,
        respond_to: oneshot::Sender<Result<usize, RegistryError>>,
    },

    /// Get a single device by ID.
    ///
    /// Returns `None` if the device is unknown.
    Get {
        device_id: DeviceId,
        respond_to: oneshot::Sender<Option<DeviceDescriptor>>,
    },

    /// Get every known device.
    GetAll {
        respond_to: oneshot::Sender<Vec<DeviceDescriptor>>,
    },

    /// Get every device no session currently holds.
    GetUnclaimed {
        respond_to: oneshot::Sender<Vec<DeviceDescriptor>>,
    },

    /// Record that `owner` now holds the device.
    ///
    /// # Errors
    /// - `RegistryError::DeviceNotFound` if the device is unknown
    MarkClaimed {
        device_id: DeviceId,
        owner: SessionId,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Record that the device is free again. Idempotent.
    ///
    /// # Errors
    /// - `RegistryError::DeviceNotFound` if the device is unknown
    MarkReleased {
        device_id: DeviceId,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Get the operating modes a device supports.
    ///
    /// Returns `None` if the device is unknown.
    AvailableModes {
        device_id: DeviceId,
        respond_to: oneshot::Sender<Option<Vec<Mode>>>,
    },

    /// Check that the device is known and supports `mode`.
    ValidateMode {
        device_id: DeviceId,
        mode: Mode,
        respond_to: oneshot::Sender<bool>,
    },

    /// The hardware link to a device dropped.
    ///
    /// Fire-and-forget: publishes a `DeviceEvent::Disconnected`.
    ReportDisconnected { device_id: DeviceId },
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The catalog has reached its maximum device capacity.
    #[error("registry is full (max: {max} devices)")]
    RegistryFull { max: usize },

    /// The requested device is not in the catalog.
    #[error("device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Device Events
// ============================================================================

/// Events published by the registry to subscribers.
///
/// The socket server forwards these to subscribed clients.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A device appeared in the catalog.
    ///
    /// The descriptor is boxed to reduce enum size variance.
    Discovered { device: Box<DeviceDescriptor> },

    /// A session took the device.
    Claimed { device_id: DeviceId, owner: SessionId },

    /// The device became available.
    Released { device_id: DeviceId },

    /// The hardware connection for the device dropped.
    Disconnected { device_id: DeviceId },
}

impl DeviceEvent {
    /// The device this event is about.
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::Discovered { device } => &device.device_id,
            Self::Claimed { device_id, .. }
            | Self::Released { device_id }
            | Self::Disconnected { device_id } => device_id,
        }
    }
}

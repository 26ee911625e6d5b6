//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending commands
//! to the registry actor and subscribing to device events.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`, or to an
//!   empty/negative answer for queries

use tokio::sync::{broadcast, mpsc, oneshot};

use devmux_core::{DeviceDescriptor, DeviceId, Mode, SessionId};

use super::commands::{DeviceEvent, RegistryCommand, RegistryError};

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the device registry actor.
///
/// This is a cheap-to-clone handle shared by every session.
///
/// # Usage
///
/// ```ignore
/// let handle = registry_handle.clone();
///
/// handle.record_discovered(devices).await?;
/// let free = handle.unclaimed_devices().await;
///
/// let mut rx = handle.subscribe();
/// while let Ok(event) = rx.recv().await {
///     // Handle event
/// }
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    /// Command sender to the actor
    sender: mpsc::Sender<RegistryCommand>,

    /// Event broadcaster for subscribing to updates
    event_sender: broadcast::Sender<DeviceEvent>,
}

impl RegistryHandle {
    pub fn new(sender: mpsc::Sender<RegistryCommand>, event_sender: broadcast::Sender<DeviceEvent>) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Merge a discovery push into the catalog. Returns how many devices were new.
    ///
    /// # Errors
    ///
    /// - `RegistryError::RegistryFull` if the catalog would exceed capacity
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn record_discovered(&self, devices: Vec<DeviceDescriptor>) -> Result<usize, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::RecordDiscovered {
                devices,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Get a single device by ID.
    ///
    /// Returns `None` if the device is unknown or the actor is gone.
    pub async fn get(&self, device_id: DeviceId) -> Option<DeviceDescriptor> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Get {
                device_id,
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Get every known device, ordered by id.
    pub async fn all_devices(&self) -> Vec<DeviceDescriptor> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::GetAll { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Get every device no session holds, ordered by id.
    pub async fn unclaimed_devices(&self) -> Vec<DeviceDescriptor> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::GetUnclaimed { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Record that `owner` holds the device.
    ///
    /// # Errors
    ///
    /// - `RegistryError::DeviceNotFound` if the device is unknown
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn mark_claimed(&self, device_id: DeviceId, owner: SessionId) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::MarkClaimed {
                device_id,
                owner,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Record that the device is free again.
    ///
    /// # Errors
    ///
    /// - `RegistryError::DeviceNotFound` if the device is unknown
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn mark_released(&self, device_id: DeviceId) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::MarkReleased {
                device_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Modes the device supports, or `None` if it is unknown.
    pub async fn available_modes(&self, device_id: DeviceId) -> Option<Vec<Mode>> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::AvailableModes {
                device_id,
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Returns false if the device is unknown or does not support `mode`.
    ///
    /// Callers treat `false` as a hard precondition failure.
    pub async fn validate_mode_compatibility(&self, device_id: DeviceId, mode: Mode) -> bool {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::ValidateMode {
                device_id,
                mode,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    /// Report that the hardware link to a device dropped. Fire-and-forget.
    pub async fn report_disconnected(&self, device_id: DeviceId) {
        let _ = self
            .sender
            .send(RegistryCommand::ReportDisconnected { device_id })
            .await;
    }

    /// Subscribe to device events.
    ///
    /// This is a synchronous operation - it doesn't communicate with the actor.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.event_sender.subscribe()
    }

    /// Returns `true` while the actor's command channel is open.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmux_core::DeviceType;

    fn create_test_handle() -> (RegistryHandle, mpsc::Receiver<RegistryCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, _event_rx) = broadcast::channel(16);
        (RegistryHandle::new(cmd_tx, event_tx), cmd_rx)
    }

    #[tokio::test]
    async fn test_record_discovered_sends_command() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::RecordDiscovered {
                devices,
                respond_to,
            }) = rx.recv().await
            {
                assert_eq!(devices.len(), 1);
                let _ = respond_to.send(Ok(1));
                return true;
            }
            false
        });

        let desc = DeviceDescriptor::new(DeviceId::new("kbd-1"), DeviceType::Keyboard, ["raw"]);
        assert_eq!(handle.record_discovered(vec![desc]).await, Ok(1));
        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_claimed_channel_closed_error() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        let result = handle
            .mark_claimed(DeviceId::new("kbd-1"), SessionId::new("session-1"))
            .await;
        assert_eq!(result, Err(RegistryError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_queries_degrade_on_channel_close() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        assert!(handle.get(DeviceId::new("kbd-1")).await.is_none());
        assert!(handle.all_devices().await.is_empty());
        assert!(handle.unclaimed_devices().await.is_empty());
        assert!(handle.available_modes(DeviceId::new("kbd-1")).await.is_none());
        assert!(
            !handle
                .validate_mode_compatibility(DeviceId::new("kbd-1"), Mode::new("raw"))
                .await
        );
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_report_disconnected_ignores_closed_channel() {
        let (handle, rx) = create_test_handle();
        drop(rx);
        handle.report_disconnected(DeviceId::new("kbd-1")).await;
    }
}

//! Registry actor - owns the device catalog and processes commands.
//!
//! The RegistryActor is the single owner of the device catalog.
//! It receives commands via an mpsc channel and publishes events via broadcast.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use devmux_core::{DeviceDescriptor, DeviceId, Mode, SessionId};

use super::commands::{DeviceEvent, RegistryCommand, RegistryError};

/// Maximum number of devices the catalog can hold.
pub const MAX_DEVICES: usize = 256;

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor - owns the device catalog.
///
/// Implements the actor pattern: receives commands via mpsc channel,
/// processes them sequentially, and publishes events to subscribers.
///
/// The catalog only records claim status. It does not arbitrate between
/// sessions; the claim table decides who gets a device.
pub struct RegistryActor {
    /// Command receiver
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Device catalog keyed by device id
    devices: HashMap<DeviceId, DeviceDescriptor>,

    /// Current holder of each claimed device, for events and logging
    owners: HashMap<DeviceId, SessionId>,

    /// Event publisher for catalog changes
    event_publisher: broadcast::Sender<DeviceEvent>,
}

impl RegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<DeviceEvent>,
    ) -> Self {
        Self {
            receiver,
            devices: HashMap::new(),
            owners: HashMap::new(),
            event_publisher,
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until the channel closes (all senders dropped).
    pub async fn run(mut self) {
        info!("Device registry starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(devices = self.devices.len(), "Device registry stopped");
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::RecordDiscovered {
                devices,
                respond_to,
            } => {
                let result = self.handle_record_discovered(devices);
                // Ignore send error - caller may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::Get {
                device_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.devices.get(&device_id).cloned());
            }
            RegistryCommand::GetAll { respond_to } => {
                let _ = respond_to.send(self.sorted(|_| true));
            }
            RegistryCommand::GetUnclaimed { respond_to } => {
                let _ = respond_to.send(self.sorted(|d| !d.claimed));
            }
            RegistryCommand::MarkClaimed {
                device_id,
                owner,
                respond_to,
            } => {
                let result = self.handle_mark_claimed(device_id, owner);
                let _ = respond_to.send(result);
            }
            RegistryCommand::MarkReleased {
                device_id,
                respond_to,
            } => {
                let result = self.handle_mark_released(device_id);
                let _ = respond_to.send(result);
            }
            RegistryCommand::AvailableModes {
                device_id,
                respond_to,
            } => {
                let modes = self
                    .devices
                    .get(&device_id)
                    .map(|d| d.capabilities.iter().cloned().collect());
                let _ = respond_to.send(modes);
            }
            RegistryCommand::ValidateMode {
                device_id,
                mode,
                respond_to,
            } => {
                let _ = respond_to.send(self.validate_mode(&device_id, &mode));
            }
            RegistryCommand::ReportDisconnected { device_id } => {
                self.handle_report_disconnected(device_id);
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    /// Merges a discovery push into the catalog.
    ///
    /// Descriptors that fail validation are skipped. Known devices have their
    /// type and capabilities refreshed but keep their claim status, since the
    /// hardware daemon does not report it.
    fn handle_record_discovered(
        &mut self,
        devices: Vec<DeviceDescriptor>,
    ) -> Result<usize, RegistryError> {
        let incoming_new = devices
            .iter()
            .filter(|d| !self.devices.contains_key(&d.device_id))
            .count();

        if self.devices.len() + incoming_new > MAX_DEVICES {
            warn!(
                current = self.devices.len(),
                incoming = incoming_new,
                max = MAX_DEVICES,
                "Registry is full, rejecting discovery push"
            );
            return Err(RegistryError::RegistryFull { max: MAX_DEVICES });
        }

        let mut added = 0;
        for mut device in devices {
            if let Err(e) = device.validate() {
                warn!(device_id = %device.device_id, error = %e, "Skipping invalid device descriptor");
                continue;
            }

            match self.devices.get_mut(&device.device_id) {
                Some(existing) => {
                    existing.device_type = device.device_type;
                    existing.capabilities = device.capabilities;
                    debug!(device_id = %existing.device_id, "Refreshed known device");
                }
                None => {
                    device.claimed = false;
                    info!(
                        device_id = %device.device_id,
                        device_type = %device.device_type,
                        modes = device.capabilities.len(),
                        "Device discovered"
                    );
                    let _ = self.event_publisher.send(DeviceEvent::Discovered {
                        device: Box::new(device.clone()),
                    });
                    self.devices.insert(device.device_id.clone(), device);
                    added += 1;
                }
            }
        }

        Ok(added)
    }

    fn handle_mark_claimed(&mut self, device_id: DeviceId, owner: SessionId) -> Result<(), RegistryError> {
        let device = self
            .devices
            .get_mut(&device_id)
            .ok_or_else(|| RegistryError::DeviceNotFound(device_id.clone()))?;

        if let Some(previous) = self.owners.get(&device_id) {
            if *previous == owner {
                return Ok(());
            }
            warn!(
                device_id = %device_id,
                previous_owner = %previous,
                new_owner = %owner,
                "Device recorded as claimed by a different session"
            );
        }

        device.claimed = true;
        self.owners.insert(device_id.clone(), owner.clone());

        debug!(device_id = %device_id, owner = %owner, "Device marked claimed");
        let _ = self
            .event_publisher
            .send(DeviceEvent::Claimed { device_id, owner });
        Ok(())
    }

    fn handle_mark_released(&mut self, device_id: DeviceId) -> Result<(), RegistryError> {
        let device = self
            .devices
            .get_mut(&device_id)
            .ok_or_else(|| RegistryError::DeviceNotFound(device_id.clone()))?;

        let was_claimed = device.claimed;
        device.claimed = false;
        self.owners.remove(&device_id);

        if was_claimed {
            debug!(device_id = %device_id, "Device marked released");
            let _ = self.event_publisher.send(DeviceEvent::Released { device_id });
        }
        Ok(())
    }

    fn handle_report_disconnected(&mut self, device_id: DeviceId) {
        if !self.devices.contains_key(&device_id) {
            debug!(device_id = %device_id, "Disconnect for unknown device, ignoring");
            return;
        }

        info!(
            device_id = %device_id,
            owner = ?self.owners.get(&device_id),
            "Device hardware connection dropped"
        );
        let _ = self
            .event_publisher
            .send(DeviceEvent::Disconnected { device_id });
    }

    fn validate_mode(&self, device_id: &DeviceId, mode: &Mode) -> bool {
        self.devices
            .get(device_id)
            .is_some_and(|d| d.supports(mode))
    }

    /// Returns matching descriptors ordered by device id.
    fn sorted(&self, keep: impl Fn(&DeviceDescriptor) -> bool) -> Vec<DeviceDescriptor> {
        let mut out: Vec<DeviceDescriptor> = self.devices.values().filter(|d| keep(d)).cloned().collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }
}

//! In-process stand-in for the hardware daemon.
//!
//! Reports a fixed inventory and answers every request on its own, the way
//! the real hardware daemon would over its socket. The shipped binary uses
//! it until a hardware transport is plugged in, and the socket integration
//! tests run against it.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use devmux_core::{DeviceDescriptor, DeviceId, Mode, SessionId};

use super::{BackendError, BackendEvent, ClaimResponse, DeviceBackend};

/// Claim refused: the device is not in the inventory.
pub const ERR_UNKNOWN_DEVICE: u32 = 2;
/// Claim refused: the device does not support the requested mode.
pub const ERR_UNSUPPORTED_MODE: u32 = 3;
/// Claim refused: another session holds the device.
pub const ERR_DEVICE_BUSY: u32 = 16;

/// Hardware daemon simulation backed by a static inventory.
pub struct LoopbackBackend {
    inventory: Vec<DeviceDescriptor>,
    /// Grants handed out, so a second session is refused like real hardware would
    grants: Mutex<HashMap<DeviceId, SessionId>>,
    events: mpsc::Sender<BackendEvent>,
}

impl LoopbackBackend {
    pub fn new(inventory: Vec<DeviceDescriptor>, events: mpsc::Sender<BackendEvent>) -> Self {
        Self {
            inventory,
            grants: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Simulates the hardware link of `device_id` dropping.
    pub fn disconnect_device(&self, device_id: DeviceId) {
        self.grants.lock().remove(&device_id);
        self.emit(BackendEvent::DeviceDisconnected { device_id });
    }

    /// Decides a claim the way the hardware daemon would.
    fn decide_claim(&self, session_id: &SessionId, device_id: &DeviceId, mode: &Mode) -> ClaimResponse {
        let Some(device) = self.inventory.iter().find(|d| &d.device_id == device_id) else {
            return ClaimResponse::rejected(ERR_UNKNOWN_DEVICE, format!("no device {device_id}"));
        };
        if !device.supports(mode) {
            return ClaimResponse::rejected(ERR_UNSUPPORTED_MODE, format!("{device_id} has no mode {mode}"));
        }

        let mut grants = self.grants.lock();
        match grants.get(device_id) {
            Some(holder) if holder != session_id => {
                ClaimResponse::rejected(ERR_DEVICE_BUSY, format!("{device_id} is held by {holder}"))
            }
            _ => {
                grants.insert(device_id.clone(), session_id.clone());
                ClaimResponse::granted()
            }
        }
    }

    /// Delivers an event off the caller's task, like a socket reply would.
    fn emit(&self, event: BackendEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            if events.send(event).await.is_err() {
                warn!("Backend event channel closed, dropping event");
            }
        });
    }
}

#[async_trait]
impl DeviceBackend for LoopbackBackend {
    async fn request_discovery(&self) -> Result<(), BackendError> {
        if self.events.is_closed() {
            return Err(BackendError::Closed);
        }
        debug!(devices = self.inventory.len(), "Loopback discovery");
        self.emit(BackendEvent::DeviceListUpdated(self.inventory.clone()));
        Ok(())
    }

    async fn claim_device(&self, session_id: &SessionId, device_id: &DeviceId, mode: &Mode) -> Result<(), BackendError> {
        if self.events.is_closed() {
            return Err(BackendError::Closed);
        }
        let response = self.decide_claim(session_id, device_id, mode);
        debug!(
            session_id = %session_id,
            device_id = %device_id,
            granted = response.is_granted(),
            "Loopback claim"
        );
        self.emit(BackendEvent::ClaimConfirmed {
            session_id: session_id.clone(),
            device_id: device_id.clone(),
            response,
        });
        Ok(())
    }

    async fn release_device(&self, session_id: &SessionId, device_id: &DeviceId) -> Result<(), BackendError> {
        if self.events.is_closed() {
            return Err(BackendError::Closed);
        }
        {
            let mut grants = self.grants.lock();
            if grants.get(device_id) == Some(session_id) {
                grants.remove(device_id);
            }
        }
        self.emit(BackendEvent::ReleaseConfirmed {
            session_id: session_id.clone(),
            device_id: device_id.clone(),
        });
        Ok(())
    }
}

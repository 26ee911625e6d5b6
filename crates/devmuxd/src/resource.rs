//! A device actively held by one session.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use devmux_core::{DeviceDescriptor, DeviceId, DevicePath, DeviceType, Mode, SessionId};

/// One device held by one session.
///
/// A session builds this optimistically when it asks for a claim; it only
/// becomes authoritative once the hardware daemon confirms and the claim
/// table accepts it. After that the claim table owns it (shared via `Arc`)
/// and only the owning session may operate on it.
#[derive(Debug)]
pub struct ClaimedResource {
    device_id: DeviceId,
    owner: SessionId,
    device_path: DevicePath,
    device_type: DeviceType,
    capabilities: BTreeSet<Mode>,
    active_mode: Mutex<Option<Mode>>,
    created_at: DateTime<Utc>,
    started: AtomicBool,
    released: AtomicBool,
    hardware_connected: AtomicBool,
}

impl ClaimedResource {
    /// Builds the local claim object for `owner` from the catalog entry.
    pub fn new(owner: SessionId, descriptor: &DeviceDescriptor) -> Self {
        Self {
            device_path: DevicePath::for_claim(&owner, &descriptor.device_id),
            device_id: descriptor.device_id.clone(),
            owner,
            device_type: descriptor.device_type,
            capabilities: descriptor.capabilities.clone(),
            active_mode: Mutex::new(None),
            created_at: Utc::now(),
            started: AtomicBool::new(false),
            released: AtomicBool::new(false),
            hardware_connected: AtomicBool::new(true),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn owner(&self) -> &SessionId {
        &self.owner
    }

    pub fn device_path(&self) -> &DevicePath {
        &self.device_path
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn capabilities(&self) -> &BTreeSet<Mode> {
        &self.capabilities
    }

    pub fn active_mode(&self) -> Option<Mode> {
        self.active_mode.lock().clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// True if `session` is the owner.
    pub fn is_owned_by(&self, session: &SessionId) -> bool {
        self.owner == *session
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn is_hardware_connected(&self) -> bool {
        self.hardware_connected.load(Ordering::Acquire)
    }

    /// Switches the device to `mode`.
    ///
    /// Returns false, leaving the current mode untouched, if the device does
    /// not support `mode` or the resource was already released.
    pub fn enable_mode(&self, mode: Mode) -> bool {
        if self.is_released() {
            return false;
        }
        if !self.capabilities.contains(&mode) {
            debug!(device_id = %self.device_id, mode = %mode, "Mode not supported by device");
            return false;
        }
        *self.active_mode.lock() = Some(mode);
        true
    }

    /// Runs once the claim is confirmed: the device starts delivering input
    /// to its owner. Returns false if it had already started.
    pub fn start(&self) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(
            device_id = %self.device_id,
            owner = %self.owner,
            path = %self.device_path,
            mode = ?self.active_mode(),
            "Device claim active"
        );
        true
    }

    /// Local teardown. Idempotent, and safe before the hardware daemon has
    /// confirmed anything. Returns true on the call that actually tore down.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.active_mode.lock() = None;
        debug!(device_id = %self.device_id, owner = %self.owner, "Local resource released");
        true
    }

    /// The hardware connection for this device dropped, whatever the state
    /// of the owning session.
    pub fn on_disconnect_notify(&self) {
        if self.hardware_connected.swap(false, Ordering::AcqRel) {
            warn!(
                device_id = %self.device_id,
                owner = %self.owner,
                "Hardware connection lost for claimed device"
            );
        }
    }
}

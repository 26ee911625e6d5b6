//! Per-client session coordinator.
//!
//! A [`ClientSession`] is created when a client completes the handshake and
//! lives until it is shut down (gracefully, or as an emergency after its
//! transport dropped). It owns the session's [`ReactiveFlagSet`], issues
//! claim and release requests to the hardware daemon, tracks them while
//! they are in flight, and keeps the backpressure and heartbeat accounting
//! for its connection.
//!
//! # Claim Lifecycle
//!
//! ```text
//!  claim() ──▶ preconditions ──▶ pending entry + timer ──▶ backend.claim_device()
//!                                        │
//!          ┌─────────────────────────────┼───────────────────────────┐
//!          ▼                             ▼                           ▼
//!   confirmation (granted)      rejection / transport error      timer expiry
//!   register in ClaimTable,     rollback                         rollback
//!   mark registry claimed,
//!   set HAS_CLAIMED_RESOURCES
//! ```
//!
//! Releases tear the local resource down immediately, then wait for the
//! hardware daemon up to the release timeout. An expired release completes
//! successfully and performs the final cleanup anyway.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Locks are `parking_lot` (no poisoning) and never held across `.await`
//! - Disconnect handler failures and panics are caught and logged

mod error;
mod liveness;
mod pending;

pub use error::SessionError;
pub use liveness::{HeartbeatCheck, MAX_MISSED_PONGS};

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use devmux_core::{DeviceDescriptor, DeviceId, Mode, ReactiveFlagSet, SessionFlags, SessionId, SessionStatusView};

use crate::backend::{ClaimResponse, DeviceBackend};
use crate::claims::ClaimTable;
use crate::registry::RegistryHandle;
use crate::resource::ClaimedResource;

use liveness::{FlowCounters, Heartbeat};
use pending::{outcome, PendingClaim, PendingDiscovery, PendingRelease, Start};

/// Called when the transport drops and the session is retained.
///
/// Errors and panics are logged and never propagate.
pub type DisconnectHandler = Arc<dyn Fn(&SessionId) -> anyhow::Result<()> + Send + Sync>;

// ============================================================================
// Settings and Shared Context
// ============================================================================

/// Timing and flow-control limits for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Unacknowledged messages at which backpressure engages
    pub max_unacknowledged: u64,
    /// Default for claims that do not carry their own timeout
    pub claim_timeout: Duration,
    pub release_timeout: Duration,
    pub discovery_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(5),
            max_unacknowledged: 64,
            claim_timeout: Duration::from_secs(5),
            release_timeout: Duration::from_secs(3),
            discovery_timeout: Duration::from_secs(5),
        }
    }
}

/// Process-wide collaborators every session talks to.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: RegistryHandle,
    pub claims: Arc<ClaimTable>,
    pub backend: Arc<dyn DeviceBackend>,
}

/// What happened to a session whose transport dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Kept with its claims, waiting for the client to come back
    Retained,
    /// Emergency-shut-down
    Terminated,
}

// ============================================================================
// Client Session
// ============================================================================

/// State and device ownership of one authenticated client.
///
/// Always used through an `Arc`: timers and background releases hold
/// references to it.
pub struct ClientSession {
    session_id: SessionId,
    client_pid: Option<u32>,
    created_at: DateTime<Utc>,
    flags: ReactiveFlagSet,
    settings: SessionSettings,
    context: SessionContext,
    heartbeat: Mutex<Heartbeat>,
    flow: Mutex<FlowCounters>,
    pending_claims: Mutex<HashMap<DeviceId, PendingClaim>>,
    pending_releases: Mutex<HashMap<DeviceId, PendingRelease>>,
    pending_discovery: Mutex<Option<PendingDiscovery>>,
    disconnect_handler: RwLock<Option<DisconnectHandler>>,
    keep_alive: AtomicBool,
    /// Source of attempt numbers for pending operations
    attempts: AtomicU64,
}

impl ClientSession {
    /// Creates an idle session with the standard flag cascades installed.
    pub fn new(
        session_id: SessionId,
        client_pid: Option<u32>,
        settings: SessionSettings,
        context: SessionContext,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            session_id,
            client_pid,
            created_at: Utc::now(),
            flags: ReactiveFlagSet::new(),
            settings,
            context,
            heartbeat: Mutex::new(Heartbeat::default()),
            flow: Mutex::new(FlowCounters::default()),
            pending_claims: Mutex::new(HashMap::new()),
            pending_releases: Mutex::new(HashMap::new()),
            pending_discovery: Mutex::new(None),
            disconnect_handler: RwLock::new(None),
            keep_alive: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
        });
        session.install_cascades();
        session
    }

    fn install_cascades(&self) {
        self.flags.on_set(SessionFlags::AUTHENTICATED, |flags, _| {
            flags.add(SessionFlags::HEARTBEAT_ENABLED);
        });
        self.flags.on_set(SessionFlags::BACKPRESSURE_ACTIVE, |flags, _| {
            flags.add(SessionFlags::FLOW_CONTROL_PAUSED);
        });
        self.flags.on_cleared(SessionFlags::BACKPRESSURE_ACTIVE, |flags, _| {
            flags.remove(SessionFlags::FLOW_CONTROL_PAUSED);
        });
        self.flags.on_set(SessionFlags::HEARTBEAT_TIMEOUT, |flags, _| {
            flags.add(SessionFlags::ERROR_STATE);
        });

        let session_id = self.session_id.clone();
        self.flags.on_set(SessionFlags::ERROR_STATE, move |_, transition| {
            warn!(session_id = %session_id, flags = %transition.current, "Session entered error state");
        });
    }

    // ------------------------------------------------------------------------
    // Identity and lifecycle flags
    // ------------------------------------------------------------------------

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn client_pid(&self) -> Option<u32> {
        self.client_pid
    }

    pub fn flags(&self) -> &ReactiveFlagSet {
        &self.flags
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Transport is up.
    pub fn mark_connected(&self) {
        self.flags.add(SessionFlags::CONNECTED);
    }

    /// Handshake completed. Enables heartbeating through the cascade.
    pub fn authenticate(&self) {
        self.flags.add(SessionFlags::AUTHENTICATED);
        debug!(session_id = %self.session_id, flags = %self.flags.snapshot(), "Session authenticated");
    }

    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.keep_alive.store(keep_alive, Ordering::Release);
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::Acquire)
    }

    /// Installs or clears the handler run when the transport drops.
    /// Installing one retains the session on disconnect.
    pub fn set_disconnect_handler(&self, handler: Option<DisconnectHandler>) {
        *self.disconnect_handler.write() = handler;
    }

    pub fn is_closed(&self) -> bool {
        self.flags.has(SessionFlags::CLOSED)
    }

    /// True if a client with `client_pid` may reattach to this session.
    pub fn can_resume(&self, client_pid: Option<u32>) -> bool {
        let flags = self.flags.snapshot();
        if flags.intersects(SessionFlags::CONNECTED | SessionFlags::DISCONNECTING | SessionFlags::CLOSED) {
            return false;
        }
        match (self.client_pid, client_pid) {
            (Some(owner), Some(caller)) => owner == caller,
            _ => true,
        }
    }

    /// The client reattached after a transport drop.
    pub fn reconnected(&self) {
        self.heartbeat.lock().reset();
        self.flags.remove(SessionFlags::HEARTBEAT_WAITING);
        self.flags.add(SessionFlags::CONNECTED);
        info!(session_id = %self.session_id, claimed = self.claimed_count(), "Session resumed");
    }

    /// Shutdown has started or finished.
    fn is_terminating(&self) -> bool {
        self.flags.has_any(SessionFlags::DISCONNECTING | SessionFlags::CLOSED)
    }

    fn ensure_can_operate(&self, operation: &'static str) -> Result<(), SessionError> {
        let flags = self.flags.snapshot();
        let ready = flags.contains(SessionFlags::CONNECTED | SessionFlags::AUTHENTICATED)
            && !flags.intersects(SessionFlags::DISCONNECTING | SessionFlags::ERROR_STATE | SessionFlags::CLOSED);
        if ready {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                flags: flags.to_string(),
            })
        }
    }

    fn next_attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    /// Asks the hardware daemon for a fresh inventory and returns the
    /// catalog once it has been merged into the registry.
    ///
    /// Concurrent calls share one request.
    pub async fn discover_devices(self: &Arc<Self>) -> Result<Vec<DeviceDescriptor>, SessionError> {
        self.ensure_can_operate("discover")?;

        let start = {
            let mut slot = self.pending_discovery.lock();
            match slot.as_mut() {
                Some(pending) => Start::Joined(pending.join()),
                None => {
                    let attempt = self.next_attempt();
                    let mut pending = PendingDiscovery::new(attempt);
                    let rx = pending.join();
                    *slot = Some(pending);
                    Start::Started { rx, attempt }
                }
            }
        };

        let rx = match start {
            Start::Joined(rx) => rx,
            Start::Started { rx, attempt } => {
                self.flags.add(SessionFlags::DISCOVERING);
                self.spawn_discovery_timer(attempt);
                if let Err(err) = self.context.backend.request_discovery().await {
                    warn!(session_id = %self.session_id, error = %err, "Discovery request failed");
                    self.fail_discovery(Some(attempt), err.into());
                }
                rx
            }
        };

        outcome(rx).await
    }

    /// Inventory push from the hardware daemon, already merged into the
    /// registry. Resolves this session's outstanding discovery, if any.
    pub fn on_device_list_updated(&self, devices: &[DeviceDescriptor]) {
        let pending = self.pending_discovery.lock().take();
        if let Some(pending) = pending {
            self.flags.remove(SessionFlags::DISCOVERING);
            debug!(session_id = %self.session_id, devices = devices.len(), "Discovery completed");
            pending.resolve(Ok(devices.to_vec()));
        }
    }

    /// Fails the outstanding discovery. With `attempt`, only that attempt.
    fn fail_discovery(&self, attempt: Option<u64>, error: SessionError) -> bool {
        let pending = {
            let mut slot = self.pending_discovery.lock();
            match slot.as_ref() {
                Some(p) if attempt.map_or(true, |a| a == p.attempt()) => slot.take(),
                _ => None,
            }
        };
        let Some(pending) = pending else {
            return false;
        };
        self.flags.remove(SessionFlags::DISCOVERING);
        pending.resolve(Err(error));
        true
    }

    fn spawn_discovery_timer(self: &Arc<Self>, attempt: u64) {
        let session = Arc::downgrade(self);
        let timeout = self.settings.discovery_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = session.upgrade() {
                if session.fail_discovery(Some(attempt), SessionError::DiscoveryTimeout) {
                    warn!(session_id = %session.session_id, "Discovery timed out");
                }
            }
        });
    }

    // ------------------------------------------------------------------------
    // Claim protocol
    // ------------------------------------------------------------------------

    /// Claims `device_id` in `mode`.
    ///
    /// Resolves when the hardware daemon confirms (with the now-registered
    /// resource), rejects, or the claim times out. `timeout` overrides the
    /// session's default claim timeout.
    ///
    /// # Errors
    ///
    /// - Precondition failures (state, unknown device, mode, conflict) are
    ///   returned without contacting the hardware daemon
    /// - `SessionError::Rejected` if the hardware daemon refused
    /// - `SessionError::ClaimTimeout` if no answer arrived in time
    /// - `SessionError::Transport` if the request could not be sent
    pub async fn claim(
        self: &Arc<Self>,
        device_id: DeviceId,
        mode: Mode,
        timeout: Option<Duration>,
    ) -> Result<Arc<ClaimedResource>, SessionError> {
        self.ensure_can_operate("claim")?;

        let descriptor = self
            .context
            .registry
            .get(device_id.clone())
            .await
            .ok_or_else(|| SessionError::UnknownDevice(device_id.clone()))?;
        if !self
            .context
            .registry
            .validate_mode_compatibility(device_id.clone(), mode.clone())
            .await
        {
            return Err(SessionError::IncompatibleMode { device_id, mode });
        }

        if let Some(existing) = self.context.claims.get(&device_id) {
            if !existing.is_owned_by(&self.session_id) {
                return Err(SessionError::Conflict(device_id));
            }
            if self.pending_releases.lock().contains_key(&device_id) {
                return Err(SessionError::ReleaseInProgress(device_id));
            }
            debug!(session_id = %self.session_id, device_id = %device_id, "Device already held by this session");
            return Ok(existing);
        }
        if descriptor.claimed {
            return Err(SessionError::Conflict(device_id));
        }

        let start = {
            let mut pending = self.pending_claims.lock();
            // Shutdown raises DISCONNECTING before draining this map
            if self.is_terminating() {
                return Err(SessionError::SessionTerminated);
            }
            if let Some(entry) = pending.get_mut(&device_id) {
                let rx = entry.pending.join();
                debug!(
                    session_id = %self.session_id,
                    device_id = %device_id,
                    waiters = entry.pending.waiter_count(),
                    "Joining in-flight claim"
                );
                Start::Joined(rx)
            } else if let Some(existing) = self.context.claims.get(&device_id) {
                // Confirmed between the checks above and taking the lock
                return if existing.is_owned_by(&self.session_id) {
                    Ok(existing)
                } else {
                    Err(SessionError::Conflict(device_id))
                };
            } else {
                let resource = Arc::new(ClaimedResource::new(self.session_id.clone(), &descriptor));
                if !resource.enable_mode(mode.clone()) {
                    return Err(SessionError::IncompatibleMode { device_id, mode });
                }
                let attempt = self.next_attempt();
                let mut entry = PendingClaim::new(attempt, resource, mode.clone());
                let rx = entry.pending.join();
                pending.insert(device_id.clone(), entry);
                Start::Started { rx, attempt }
            }
        };

        let rx = match start {
            Start::Joined(rx) => rx,
            Start::Started { rx, attempt } => {
                let timeout = timeout.unwrap_or(self.settings.claim_timeout);
                self.spawn_claim_timer(device_id.clone(), attempt, timeout);
                debug!(
                    session_id = %self.session_id,
                    device_id = %device_id,
                    mode = %mode,
                    attempt,
                    "Claim requested"
                );
                if let Err(err) = self
                    .context
                    .backend
                    .claim_device(&self.session_id, &device_id, &mode)
                    .await
                {
                    warn!(session_id = %self.session_id, device_id = %device_id, error = %err, "Claim request failed");
                    self.rollback_claim(&device_id, Some(attempt), err.into());
                }
                rx
            }
        };

        outcome(rx).await
    }

    /// Claim answer from the hardware daemon.
    ///
    /// A confirmation with no pending claim is stale: the device is handed
    /// back with a best-effort release unless this session already holds it.
    pub async fn on_claim_confirmed(&self, device_id: DeviceId, response: ClaimResponse) {
        if !response.is_granted() {
            let error = SessionError::Rejected {
                device_id: device_id.clone(),
                code: response.error_code.unwrap_or_default(),
                message: response.message.unwrap_or_else(|| "claim rejected".to_string()),
            };
            if !self.rollback_claim(&device_id, None, error) {
                debug!(session_id = %self.session_id, device_id = %device_id, "Ignoring stale claim rejection");
            }
            return;
        }

        // Register under the pending lock so a concurrent claim() sees
        // either the pending entry or the registered resource.
        let confirmed = {
            let mut pending = self.pending_claims.lock();
            match pending.remove(&device_id) {
                Some(entry) if self.is_terminating() => Err(entry),
                Some(entry) => {
                    let registered = self.context.claims.try_register(Arc::clone(&entry.resource));
                    Ok(Some((entry, registered)))
                }
                None => Ok(None),
            }
        };

        let confirmed = match confirmed {
            Ok(confirmed) => confirmed,
            Err(entry) => {
                warn!(session_id = %self.session_id, device_id = %device_id, "Claim confirmed during shutdown, releasing device");
                entry.resource.release();
                entry.pending.resolve(Err(SessionError::SessionTerminated));
                self.release_remote(device_id);
                return;
            }
        };

        let Some((entry, registered)) = confirmed else {
            if self.owns(&device_id) {
                debug!(session_id = %self.session_id, device_id = %device_id, "Duplicate claim confirmation");
            } else {
                warn!(session_id = %self.session_id, device_id = %device_id, "Stale claim confirmation, releasing device");
                self.release_remote(device_id);
            }
            return;
        };

        if let Err(holder) = registered {
            warn!(
                session_id = %self.session_id,
                device_id = %device_id,
                holder = %holder,
                "Claim confirmed for a device held by another session"
            );
            entry.resource.release();
            entry.pending.resolve(Err(SessionError::Conflict(device_id.clone())));
            self.sync_claimed_flag();
            self.release_remote(device_id);
            return;
        }

        if let Err(err) = self
            .context
            .registry
            .mark_claimed(device_id.clone(), self.session_id.clone())
            .await
        {
            warn!(session_id = %self.session_id, device_id = %device_id, error = %err, "Registry did not record claim");
        }

        // Shutdown may have torn the resource down while the registry was
        // recording it; undo the record it could have missed.
        if !self.holds(&entry.resource) {
            debug!(session_id = %self.session_id, device_id = %device_id, "Claim torn down while confirming");
            if self.context.claims.owner_of(&device_id).is_none() {
                if let Err(err) = self.context.registry.mark_released(device_id.clone()).await {
                    debug!(session_id = %self.session_id, device_id = %device_id, error = %err, "Registry did not record release");
                }
            }
            entry.pending.resolve(Err(SessionError::SessionTerminated));
            self.sync_claimed_flag();
            return;
        }
        self.flags.add(SessionFlags::HAS_CLAIMED_RESOURCES);
        entry.resource.start();
        info!(
            session_id = %self.session_id,
            device_id = %device_id,
            mode = %entry.mode,
            "Device claimed"
        );
        entry.pending.resolve(Ok(Arc::clone(&entry.resource)));
    }

    /// Undoes a pending claim. With `attempt`, only that attempt.
    /// Returns false if there was nothing to roll back.
    fn rollback_claim(&self, device_id: &DeviceId, attempt: Option<u64>, error: SessionError) -> bool {
        let entry = {
            let mut pending = self.pending_claims.lock();
            match pending.get(device_id) {
                Some(entry) if attempt.map_or(true, |a| a == entry.pending.attempt()) => pending.remove(device_id),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return false;
        };

        entry.resource.release();
        warn!(session_id = %self.session_id, device_id = %device_id, error = %error, "Claim rolled back");
        entry.pending.resolve(Err(error));
        self.sync_claimed_flag();
        true
    }

    fn spawn_claim_timer(self: &Arc<Self>, device_id: DeviceId, attempt: u64, timeout: Duration) {
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = session.upgrade() {
                let error = SessionError::ClaimTimeout(device_id.clone());
                session.rollback_claim(&device_id, Some(attempt), error);
            }
        });
    }

    // ------------------------------------------------------------------------
    // Release protocol
    // ------------------------------------------------------------------------

    /// Releases `device_id`.
    ///
    /// Succeeds immediately if this session does not hold the device. Local
    /// teardown happens before the hardware daemon is asked; if it does not
    /// answer within the release timeout the release completes anyway.
    ///
    /// # Errors
    ///
    /// `SessionError::Transport` if the request could not be sent. The
    /// device has been released locally and globally regardless.
    pub async fn release(self: &Arc<Self>, device_id: DeviceId) -> Result<(), SessionError> {
        let start = {
            let mut pending = self.pending_releases.lock();
            if let Some(entry) = pending.get_mut(&device_id) {
                Start::Joined(entry.pending.join())
            } else {
                let Some(resource) = self.resource(&device_id).ok() else {
                    return Ok(());
                };
                let attempt = self.next_attempt();
                let mut entry = PendingRelease::new(attempt, Arc::clone(&resource));
                let rx = entry.pending.join();
                pending.insert(device_id.clone(), entry);
                // Local cleanup does not wait for the hardware daemon
                resource.release();
                Start::Started { rx, attempt }
            }
        };

        let rx = match start {
            Start::Joined(rx) => rx,
            Start::Started { rx, attempt } => {
                self.spawn_release_timer(device_id.clone(), attempt);
                debug!(session_id = %self.session_id, device_id = %device_id, attempt, "Release requested");
                if let Err(err) = self
                    .context
                    .backend
                    .release_device(&self.session_id, &device_id)
                    .await
                {
                    warn!(session_id = %self.session_id, device_id = %device_id, error = %err, "Release request failed");
                    if let Some(entry) = self.take_pending_release(&device_id, Some(attempt)) {
                        self.finish_release(&device_id).await;
                        entry.pending.resolve(Err(err.into()));
                    }
                }
                rx
            }
        };

        outcome(rx).await
    }

    /// Release acknowledgement from the hardware daemon.
    ///
    /// Without a pending release the acknowledgement is stale and ignored;
    /// whatever removed the entry already did the cleanup.
    pub async fn on_release_confirmed(&self, device_id: DeviceId) {
        let Some(entry) = self.take_pending_release(&device_id, None) else {
            debug!(session_id = %self.session_id, device_id = %device_id, "Ignoring stale release confirmation");
            return;
        };
        self.finish_release(&device_id).await;
        entry.pending.resolve(Ok(()));
    }

    fn take_pending_release(&self, device_id: &DeviceId, attempt: Option<u64>) -> Option<PendingRelease> {
        let mut pending = self.pending_releases.lock();
        match pending.get(device_id) {
            Some(entry) if attempt.map_or(true, |a| a == entry.pending.attempt()) => pending.remove(device_id),
            _ => None,
        }
    }

    fn spawn_release_timer(self: &Arc<Self>, device_id: DeviceId, attempt: u64) {
        let session: Weak<Self> = Arc::downgrade(self);
        let timeout = self.settings.release_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            if let Some(entry) = session.take_pending_release(&device_id, Some(attempt)) {
                warn!(
                    session_id = %session.session_id,
                    device_id = %device_id,
                    "Release not acknowledged in time, completing locally"
                );
                session.finish_release(&device_id).await;
                entry.pending.resolve(Ok(()));
            }
        });
    }

    /// Removes the device from the claim table and marks it free in the
    /// registry. Idempotent.
    async fn finish_release(&self, device_id: &DeviceId) {
        if let Some(resource) = self.context.claims.remove_owned(device_id, &self.session_id) {
            resource.release();
            if let Err(err) = self.context.registry.mark_released(device_id.clone()).await {
                warn!(session_id = %self.session_id, device_id = %device_id, error = %err, "Registry did not record release");
            }
            info!(
                session_id = %self.session_id,
                device_id = %device_id,
                held_secs = (Utc::now() - resource.created_at()).num_seconds(),
                "Device released"
            );
        }
        self.sync_claimed_flag();
    }

    /// Best-effort release at the hardware daemon, without waiting.
    fn release_remote(&self, device_id: DeviceId) {
        let backend = Arc::clone(&self.context.backend);
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            if let Err(err) = backend.release_device(&session_id, &device_id).await {
                debug!(session_id = %session_id, device_id = %device_id, error = %err, "Best-effort release failed");
            }
        });
    }

    /// Keeps `HAS_CLAIMED_RESOURCES` in line with the claim table.
    fn sync_claimed_flag(&self) {
        if self.context.claims.count_owned(&self.session_id) > 0 {
            self.flags.add(SessionFlags::HAS_CLAIMED_RESOURCES);
        } else {
            self.flags.remove(SessionFlags::HAS_CLAIMED_RESOURCES);
        }
    }

    // ------------------------------------------------------------------------
    // Ownership queries
    // ------------------------------------------------------------------------

    /// The resource for `device_id`, if this session holds it.
    ///
    /// # Errors
    ///
    /// `SessionError::NotOwner` if the device is free or held by another
    /// session.
    pub fn resource(&self, device_id: &DeviceId) -> Result<Arc<ClaimedResource>, SessionError> {
        self.context
            .claims
            .get(device_id)
            .filter(|resource| resource.is_owned_by(&self.session_id))
            .ok_or_else(|| SessionError::NotOwner(device_id.clone()))
    }

    pub fn owns(&self, device_id: &DeviceId) -> bool {
        self.resource(device_id).is_ok()
    }

    /// True if `resource` itself is the entry registered for its device.
    fn holds(&self, resource: &Arc<ClaimedResource>) -> bool {
        self.context
            .claims
            .get(resource.device_id())
            .is_some_and(|current| Arc::ptr_eq(&current, resource))
    }

    pub fn claimed_count(&self) -> usize {
        self.context.claims.count_owned(&self.session_id)
    }

    pub fn claimed_devices(&self) -> Vec<DeviceId> {
        self.context
            .claims
            .owned_by(&self.session_id)
            .iter()
            .map(|resource| resource.device_id().clone())
            .collect()
    }

    pub fn pending_claim_count(&self) -> usize {
        self.pending_claims.lock().len()
    }

    pub fn pending_release_count(&self) -> usize {
        self.pending_releases.lock().len()
    }

    // ------------------------------------------------------------------------
    // Backpressure
    // ------------------------------------------------------------------------

    /// Counts one message sent to the client.
    pub fn message_sent(&self) {
        let mut flow = self.flow.lock();
        flow.record_sent();
        self.apply_backpressure(&flow);
    }

    /// Counts `count` messages acknowledged by the client.
    pub fn messages_acknowledged(&self, count: u64) {
        let mut flow = self.flow.lock();
        flow.record_acknowledged(count);
        self.apply_backpressure(&flow);
    }

    /// Applied under the counter lock so decisions land in order.
    fn apply_backpressure(&self, flow: &FlowCounters) {
        match flow.evaluate(self.settings.max_unacknowledged) {
            Some(true) => {
                if self.flags.add(SessionFlags::BACKPRESSURE_ACTIVE) {
                    debug!(session_id = %self.session_id, outstanding = flow.outstanding(), "Backpressure on");
                }
            }
            Some(false) => {
                if self.flags.remove(SessionFlags::BACKPRESSURE_ACTIVE) {
                    debug!(session_id = %self.session_id, outstanding = flow.outstanding(), "Backpressure off");
                }
            }
            None => {}
        }
    }

    /// True while pushes to this client should be withheld.
    pub fn is_flow_paused(&self) -> bool {
        self.flags.has(SessionFlags::FLOW_CONTROL_PAUSED)
    }

    // ------------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------------

    /// Records a ping sent to the client and returns its sequence number.
    pub fn send_ping(&self) -> u64 {
        let seq = self.heartbeat.lock().ping_sent(Instant::now());
        self.flags.add(SessionFlags::HEARTBEAT_WAITING);
        seq
    }

    pub fn received_pong(&self) {
        self.heartbeat.lock().pong_received();
        self.flags.remove(SessionFlags::HEARTBEAT_WAITING);
    }

    /// Periodic liveness check. A no-op until heartbeating is enabled.
    pub fn check_heartbeat(&self) -> HeartbeatCheck {
        if !self.flags.has(SessionFlags::HEARTBEAT_ENABLED) {
            return HeartbeatCheck::Disabled;
        }
        if self.flags.has(SessionFlags::HEARTBEAT_TIMEOUT) {
            return HeartbeatCheck::TimedOut;
        }
        if !self.flags.has(SessionFlags::HEARTBEAT_WAITING) {
            return HeartbeatCheck::Healthy;
        }

        let missed = self
            .heartbeat
            .lock()
            .overdue(Instant::now(), self.settings.heartbeat_timeout);
        match missed {
            None => HeartbeatCheck::Healthy,
            Some(missed) if missed >= MAX_MISSED_PONGS => {
                warn!(session_id = %self.session_id, missed, "Heartbeat timed out");
                self.flags.add(SessionFlags::HEARTBEAT_TIMEOUT);
                HeartbeatCheck::TimedOut
            }
            Some(missed) => {
                debug!(session_id = %self.session_id, missed, "Pong overdue");
                HeartbeatCheck::Missed(missed)
            }
        }
    }

    /// Connected, authenticated and not failed.
    pub fn is_healthy(&self) -> bool {
        let flags = self.flags.snapshot();
        flags.contains(SessionFlags::CONNECTED | SessionFlags::AUTHENTICATED)
            && !flags.intersects(SessionFlags::ERROR_STATE | SessionFlags::HEARTBEAT_TIMEOUT)
    }

    // ------------------------------------------------------------------------
    // Disconnect policy and shutdown
    // ------------------------------------------------------------------------

    /// The client transport dropped.
    ///
    /// An outstanding discovery always fails. A session with keep-alive or
    /// a disconnect handler only loses `CONNECTED` and keeps its claims;
    /// any other session is emergency-shut-down.
    pub async fn on_transport_disconnected(self: &Arc<Self>) -> DisconnectOutcome {
        self.fail_discovery(None, SessionError::Transport("client transport disconnected".to_string()));

        let handler = self.disconnect_handler.read().clone();
        if self.keep_alive() || handler.is_some() {
            self.flags.remove(SessionFlags::CONNECTED | SessionFlags::HEARTBEAT_WAITING);
            if let Some(handler) = handler {
                self.invoke_disconnect_handler(&handler);
            }
            info!(
                session_id = %self.session_id,
                claimed = self.claimed_count(),
                "Transport lost, session retained"
            );
            return DisconnectOutcome::Retained;
        }

        self.emergency_shutdown().await;
        DisconnectOutcome::Terminated
    }

    fn invoke_disconnect_handler(&self, handler: &DisconnectHandler) {
        match catch_unwind(AssertUnwindSafe(|| handler(&self.session_id))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(session_id = %self.session_id, error = %err, "Disconnect handler failed");
            }
            Err(_) => {
                error!(session_id = %self.session_id, "Disconnect handler panicked");
            }
        }
    }

    /// Tears the session down without waiting for the hardware daemon.
    ///
    /// Every pending claim, release and discovery fails with
    /// `SessionTerminated`, every held device is released locally and
    /// globally, and the hardware daemon is told on a best-effort basis.
    pub async fn emergency_shutdown(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        warn!(session_id = %self.session_id, claimed = self.claimed_count(), "Emergency shutdown");
        self.flags.add(SessionFlags::DISCONNECTING);

        let claims: Vec<PendingClaim> = self.pending_claims.lock().drain().map(|(_, e)| e).collect();
        let releases: Vec<PendingRelease> = self.pending_releases.lock().drain().map(|(_, e)| e).collect();
        self.fail_discovery(None, SessionError::SessionTerminated);

        for entry in claims {
            entry.resource.release();
            entry.pending.resolve(Err(SessionError::SessionTerminated));
        }

        for resource in self.context.claims.owned_by(&self.session_id) {
            resource.release();
            self.finish_release(resource.device_id()).await;
            self.release_remote(resource.device_id().clone());
        }

        for entry in releases {
            entry.resource.release();
            entry.pending.resolve(Err(SessionError::SessionTerminated));
        }

        self.close();
    }

    /// Graceful shutdown: pending claims fail, every held device goes
    /// through the normal release path and all releases are awaited before
    /// the session is closed.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        info!(session_id = %self.session_id, claimed = self.claimed_count(), "Shutting down session");
        self.flags.add(SessionFlags::DISCONNECTING);

        let claims: Vec<PendingClaim> = self.pending_claims.lock().drain().map(|(_, e)| e).collect();
        for entry in claims {
            entry.resource.release();
            entry.pending.resolve(Err(SessionError::SessionTerminated));
        }
        self.fail_discovery(None, SessionError::SessionTerminated);

        let mut releases = JoinSet::new();
        for resource in self.context.claims.owned_by(&self.session_id) {
            let session = Arc::clone(self);
            let device_id = resource.device_id().clone();
            releases.spawn(async move {
                let result = session.release(device_id.clone()).await;
                (device_id, result)
            });
        }
        while let Some(joined) = releases.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((device_id, Err(err))) => {
                    warn!(session_id = %self.session_id, device_id = %device_id, error = %err, "Release during shutdown failed");
                }
                Err(err) => {
                    error!(session_id = %self.session_id, error = %err, "Release task failed");
                }
            }
        }

        self.close();
    }

    fn close(&self) {
        self.sync_claimed_flag();
        // CLOSED goes up before DISCONNECTING comes down
        self.flags.add(SessionFlags::CLOSED);
        self.flags.remove(
            SessionFlags::CONNECTED
                | SessionFlags::AUTHENTICATED
                | SessionFlags::HEARTBEAT_ENABLED
                | SessionFlags::HEARTBEAT_WAITING
                | SessionFlags::DISCOVERING
                | SessionFlags::DISCONNECTING,
        );
        info!(
            session_id = %self.session_id,
            flags = %self.flags.snapshot(),
            lifetime_secs = (Utc::now() - self.created_at).num_seconds(),
            "Session closed"
        );
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    pub fn status_view(&self) -> SessionStatusView {
        let flow = *self.flow.lock();
        SessionStatusView {
            session_id: self.session_id.clone(),
            flags: self.flags.snapshot().names(),
            healthy: self.is_healthy(),
            claimed_devices: self.claimed_devices(),
            pending_claims: self.pending_claim_count(),
            pending_releases: self.pending_release_count(),
            messages_sent: flow.sent,
            messages_acknowledged: flow.acknowledged,
            missed_pongs: self.heartbeat.lock().missed_pongs,
            keep_alive: self.keep_alive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackendEvent, LoopbackBackend};
    use crate::registry::spawn_registry;
    use async_trait::async_trait;
    use devmux_core::DeviceType;
    use tokio::sync::mpsc;

    /// Backend that accepts every request and never answers.
    struct SilentBackend;

    #[async_trait]
    impl DeviceBackend for SilentBackend {
        async fn request_discovery(&self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn claim_device(&self, _: &SessionId, _: &DeviceId, _: &Mode) -> Result<(), BackendError> {
            Ok(())
        }

        async fn release_device(&self, _: &SessionId, _: &DeviceId) -> Result<(), BackendError> {
            Ok(())
        }
    }

    async fn context_with(backend: Arc<dyn DeviceBackend>) -> SessionContext {
        let registry = spawn_registry();
        registry
            .record_discovered(vec![DeviceDescriptor::new(
                DeviceId::new("kbd-1"),
                DeviceType::Keyboard,
                ["raw", "parsed"],
            )])
            .await
            .unwrap();
        SessionContext {
            registry,
            claims: Arc::new(ClaimTable::new()),
            backend,
        }
    }

    fn open(id: &str, context: SessionContext, settings: SessionSettings) -> Arc<ClientSession> {
        let session = ClientSession::new(SessionId::new(id), Some(42), settings, context);
        session.mark_connected();
        session.authenticate();
        session
    }

    #[tokio::test]
    async fn test_authenticate_enables_heartbeat() {
        let context = context_with(Arc::new(SilentBackend)).await;
        let session = open("s1", context, SessionSettings::default());
        assert!(session.flags().has(SessionFlags::HEARTBEAT_ENABLED));
        assert!(session.is_healthy());
    }

    #[tokio::test]
    async fn test_claim_rejected_before_authentication() {
        let context = context_with(Arc::new(SilentBackend)).await;
        let session = ClientSession::new(SessionId::new("s1"), None, SessionSettings::default(), context);
        session.mark_connected();

        let err = session
            .claim(DeviceId::new("kbd-1"), Mode::new("raw"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { operation: "claim", .. }));
    }

    #[tokio::test]
    async fn test_claim_precondition_errors() {
        let context = context_with(Arc::new(SilentBackend)).await;
        let session = open("s1", context, SessionSettings::default());

        let unknown = session.claim(DeviceId::new("ghost"), Mode::new("raw"), None).await;
        assert_eq!(unknown.unwrap_err(), SessionError::UnknownDevice(DeviceId::new("ghost")));

        let bad_mode = session.claim(DeviceId::new("kbd-1"), Mode::new("midi"), None).await;
        assert!(matches!(bad_mode.unwrap_err(), SessionError::IncompatibleMode { .. }));
        assert_eq!(session.pending_claim_count(), 0);
    }

    #[tokio::test]
    async fn test_rejection_rolls_back() {
        let context = context_with(Arc::new(SilentBackend)).await;
        let session = open("s1", context, SessionSettings::default());

        let claimer = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.claim(DeviceId::new("kbd-1"), Mode::new("raw"), None).await })
        };
        while session.pending_claim_count() == 0 {
            tokio::task::yield_now().await;
        }

        session
            .on_claim_confirmed(DeviceId::new("kbd-1"), ClaimResponse::rejected(16, "busy"))
            .await;

        let err = claimer.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Rejected { code: 16, .. }));
        assert_eq!(session.pending_claim_count(), 0);
        assert!(!session.flags().has(SessionFlags::HAS_CLAIMED_RESOURCES));
    }

    #[tokio::test]
    async fn test_loopback_claim_and_release() {
        let (tx, mut rx) = mpsc::channel(16);
        let inventory = vec![DeviceDescriptor::new(DeviceId::new("kbd-1"), DeviceType::Keyboard, ["raw"])];
        let context = context_with(Arc::new(LoopbackBackend::new(inventory, tx))).await;
        let session = open("s1", context.clone(), SessionSettings::default());

        // Route backend answers back into the session, as the daemon would
        let pump = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        BackendEvent::ClaimConfirmed { device_id, response, .. } => {
                            session.on_claim_confirmed(device_id, response).await
                        }
                        BackendEvent::ReleaseConfirmed { device_id, .. } => session.on_release_confirmed(device_id).await,
                        _ => {}
                    }
                }
            })
        };

        let resource = session
            .claim(DeviceId::new("kbd-1"), Mode::new("raw"), None)
            .await
            .unwrap();
        assert_eq!(resource.active_mode(), Some(Mode::new("raw")));
        assert!(session.flags().has(SessionFlags::HAS_CLAIMED_RESOURCES));
        assert!(context.registry.get(DeviceId::new("kbd-1")).await.unwrap().claimed);

        session.release(DeviceId::new("kbd-1")).await.unwrap();
        assert_eq!(session.claimed_count(), 0);
        assert!(!session.flags().has(SessionFlags::HAS_CLAIMED_RESOURCES));
        assert!(!context.registry.get(DeviceId::new("kbd-1")).await.unwrap().claimed);

        pump.abort();
    }

    #[tokio::test]
    async fn test_release_of_unowned_device_is_noop() {
        let context = context_with(Arc::new(SilentBackend)).await;
        let session = open("s1", context, SessionSettings::default());
        assert_eq!(session.release(DeviceId::new("kbd-1")).await, Ok(()));
        assert_eq!(session.pending_release_count(), 0);
    }

    #[tokio::test]
    async fn test_backpressure_cascades_to_flow_pause() {
        let context = context_with(Arc::new(SilentBackend)).await;
        let settings = SessionSettings {
            max_unacknowledged: 4,
            ..SessionSettings::default()
        };
        let session = open("s1", context, settings);

        for _ in 0..4 {
            session.message_sent();
        }
        assert!(session.flags().has(SessionFlags::BACKPRESSURE_ACTIVE));
        assert!(session.is_flow_paused());

        session.messages_acknowledged(3);
        assert!(!session.is_flow_paused());
    }

    #[tokio::test]
    async fn test_disconnect_handler_errors_are_contained() {
        let context = context_with(Arc::new(SilentBackend)).await;
        let session = open("s1", context, SessionSettings::default());
        session.set_disconnect_handler(Some(Arc::new(|_: &SessionId| -> anyhow::Result<()> {
            anyhow::bail!("handler failed")
        })));

        assert_eq!(session.on_transport_disconnected().await, DisconnectOutcome::Retained);
        assert!(!session.flags().has(SessionFlags::CONNECTED));
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_panicking_disconnect_handler_is_contained() {
        let context = context_with(Arc::new(SilentBackend)).await;
        let session = open("s1", context, SessionSettings::default());
        session.set_disconnect_handler(Some(Arc::new(|_: &SessionId| -> anyhow::Result<()> { panic!("boom") })));

        assert_eq!(session.on_transport_disconnected().await, DisconnectOutcome::Retained);
        assert!(session.can_resume(Some(42)));
        assert!(!session.can_resume(Some(7)));

        session.reconnected();
        assert!(session.is_healthy());
    }

    #[tokio::test]
    async fn test_status_view() {
        let context = context_with(Arc::new(SilentBackend)).await;
        let session = open("s1", context, SessionSettings::default());
        session.set_keep_alive(true);
        session.message_sent();

        let view = session.status_view();
        assert_eq!(view.session_id.as_str(), "s1");
        assert!(view.healthy);
        assert!(view.keep_alive);
        assert_eq!(view.messages_sent, 1);
        assert!(view.has_flag("authenticated"));
    }
}

//! Parent coordinator for every client session.
//!
//! The [`ResourceDaemon`] owns the session map, the global claim table and
//! the outbound [`DeviceBackend`]. It drains the hardware daemon's
//! [`BackendEvent`]s and routes each one to the session it concerns.
//!
//! # Architecture
//!
//! ```text
//!                        ┌──────────────────────────┐
//!   connection ─────────▶│      ResourceDaemon      │
//!   handlers             │  sessions: DashMap       │
//!                        │  claims:   ClaimTable    │
//!                        └─────┬───────────────▲────┘
//!                              │               │ BackendEvent (mpsc)
//!                  ClientSession::claim()      │
//!                              ▼               │
//!                        DeviceBackend ──▶ hardware daemon
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devmux_core::{DeviceDescriptor, DeviceId, SessionFlags, SessionId};

use crate::backend::{BackendEvent, ClaimResponse, DeviceBackend};
use crate::claims::ClaimTable;
use crate::registry::RegistryHandle;
use crate::session::{ClientSession, DisconnectOutcome, SessionContext, SessionSettings};

/// Coordinator owning every session and the shared claim state.
pub struct ResourceDaemon {
    sessions: DashMap<SessionId, Arc<ClientSession>>,
    next_session: AtomicU64,
    context: SessionContext,
    settings: SessionSettings,
    /// How long a retained session waits for its client to come back
    reconnect_grace: Duration,
}

impl ResourceDaemon {
    pub fn new(
        registry: RegistryHandle,
        backend: Arc<dyn DeviceBackend>,
        settings: SessionSettings,
        reconnect_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            next_session: AtomicU64::new(0),
            context: SessionContext {
                registry,
                claims: Arc::new(ClaimTable::new()),
                backend,
            },
            settings,
            reconnect_grace,
        })
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.context.registry
    }

    pub fn claims(&self) -> &ClaimTable {
        &self.context.claims
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    // ------------------------------------------------------------------------
    // Backend event routing
    // ------------------------------------------------------------------------

    /// Drains backend events until the channel closes or `cancel` fires.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<BackendEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Backend event pump stopping");
                        break;
                    }
                    event = events.recv() => match event {
                        Some(event) => daemon.handle_backend_event(event).await,
                        None => {
                            warn!("Backend event channel closed");
                            break;
                        }
                    }
                }
            }
        })
    }

    pub async fn handle_backend_event(&self, event: BackendEvent) {
        match event {
            BackendEvent::DeviceListUpdated(devices) => self.on_device_list_updated(devices).await,
            BackendEvent::ClaimConfirmed {
                session_id,
                device_id,
                response,
            } => self.on_claim_confirmed(session_id, device_id, response).await,
            BackendEvent::ReleaseConfirmed { session_id, device_id } => {
                self.on_release_confirmed(session_id, device_id).await
            }
            BackendEvent::DeviceDisconnected { device_id } => self.on_device_disconnected(device_id).await,
        }
    }

    /// Merges an inventory push into the registry and completes every
    /// session's outstanding discovery with the merged catalog.
    pub async fn on_device_list_updated(&self, devices: Vec<DeviceDescriptor>) {
        let reported = devices.len();
        match self.context.registry.record_discovered(devices).await {
            Ok(new) => info!(reported, new, "Device inventory updated"),
            Err(err) => warn!(reported, error = %err, "Device inventory not fully recorded"),
        }

        let catalog = self.context.registry.all_devices().await;
        for session in self.all_sessions() {
            session.on_device_list_updated(&catalog);
        }
    }

    pub async fn on_claim_confirmed(&self, session_id: SessionId, device_id: DeviceId, response: ClaimResponse) {
        match self.session(&session_id) {
            Some(session) => session.on_claim_confirmed(device_id, response).await,
            None if response.is_granted() => {
                warn!(
                    session_id = %session_id,
                    device_id = %device_id,
                    "Claim granted to unknown session, releasing device"
                );
                self.release_orphan(session_id, device_id);
            }
            None => {
                debug!(session_id = %session_id, device_id = %device_id, "Rejection for unknown session ignored");
            }
        }
    }

    pub async fn on_release_confirmed(&self, session_id: SessionId, device_id: DeviceId) {
        match self.session(&session_id) {
            Some(session) => session.on_release_confirmed(device_id).await,
            None => {
                debug!(session_id = %session_id, device_id = %device_id, "Release confirmation for unknown session");
            }
        }
    }

    /// Hardware link of a device dropped. The holder, if any, is notified;
    /// the claim stays until its owner releases it.
    pub async fn on_device_disconnected(&self, device_id: DeviceId) {
        if let Some(resource) = self.context.claims.get(&device_id) {
            resource.on_disconnect_notify();
        }
        self.context.registry.report_disconnected(device_id).await;
    }

    fn release_orphan(&self, session_id: SessionId, device_id: DeviceId) {
        let backend = Arc::clone(&self.context.backend);
        tokio::spawn(async move {
            if let Err(err) = backend.release_device(&session_id, &device_id).await {
                debug!(session_id = %session_id, device_id = %device_id, error = %err, "Orphan release failed");
            }
        });
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    /// Creates a connected, authenticated session.
    pub fn open_session(&self, client_pid: Option<u32>, keep_alive: bool) -> Arc<ClientSession> {
        let n = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let session_id = SessionId::from_sequence(n);
        let session = ClientSession::new(
            session_id.clone(),
            client_pid,
            self.settings.clone(),
            self.context.clone(),
        );
        session.set_keep_alive(keep_alive);
        session.mark_connected();
        session.authenticate();
        self.sessions.insert(session_id.clone(), Arc::clone(&session));

        info!(session_id = %session_id, client_pid = ?client_pid, keep_alive, "Session opened");
        session
    }

    /// Reattaches a client to a retained session.
    ///
    /// Returns `None` if the session is unknown, still connected, closed,
    /// or belongs to a different client process.
    pub fn resume_session(&self, session_id: &SessionId, client_pid: Option<u32>) -> Option<Arc<ClientSession>> {
        let session = self.session(session_id)?;
        if !session.can_resume(client_pid) {
            warn!(session_id = %session_id, client_pid = ?client_pid, "Session resume refused");
            return None;
        }
        session.reconnected();
        Some(session)
    }

    pub fn session(&self, session_id: &SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.get(session_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn all_sessions(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// A client connection dropped without a `Disconnect`.
    ///
    /// Terminated sessions are forgotten. Retained ones get
    /// `reconnect_grace` to be resumed before they are emergency-shut-down.
    pub async fn on_transport_disconnected(self: &Arc<Self>, session_id: &SessionId) -> Option<DisconnectOutcome> {
        let session = self.session(session_id)?;
        let outcome = session.on_transport_disconnected().await;
        match outcome {
            DisconnectOutcome::Terminated => {
                self.sessions.remove(session_id);
            }
            DisconnectOutcome::Retained => self.spawn_grace_timer(session),
        }
        Some(outcome)
    }

    fn spawn_grace_timer(self: &Arc<Self>, session: Arc<ClientSession>) {
        let daemon = Arc::downgrade(self);
        let grace = self.reconnect_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(daemon) = daemon.upgrade() else {
                return;
            };
            if session.flags().has(SessionFlags::CONNECTED) || session.is_closed() {
                return;
            }
            warn!(session_id = %session.session_id(), ?grace, "Retained session not resumed in time");
            session.emergency_shutdown().await;
            daemon
                .sessions
                .remove_if(session.session_id(), |_, current| Arc::ptr_eq(current, &session));
        });
    }

    /// Graceful shutdown of one session, then forget it.
    ///
    /// The session stays routable until its releases are confirmed.
    pub async fn close_session(&self, session_id: &SessionId) {
        let Some(session) = self.session(session_id) else {
            return;
        };
        session.shutdown().await;
        self.sessions
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, &session));
    }

    /// Graceful shutdown of every session.
    pub async fn shutdown_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        info!(sessions = ids.len(), "Shutting down all sessions");
        for id in ids {
            self.close_session(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LoopbackBackend;
    use crate::registry::spawn_registry;
    use devmux_core::DeviceType;

    fn daemon() -> (Arc<ResourceDaemon>, mpsc::Receiver<BackendEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let inventory = vec![DeviceDescriptor::new(DeviceId::new("kbd-1"), DeviceType::Keyboard, ["raw"])];
        let backend = Arc::new(LoopbackBackend::new(inventory, tx));
        let daemon = ResourceDaemon::new(
            spawn_registry(),
            backend,
            SessionSettings::default(),
            Duration::from_secs(30),
        );
        (daemon, rx)
    }

    #[tokio::test]
    async fn test_open_session_assigns_sequential_ids() {
        let (daemon, _rx) = daemon();
        let a = daemon.open_session(Some(1), false);
        let b = daemon.open_session(None, true);

        assert_eq!(a.session_id().as_str(), "session-1");
        assert_eq!(b.session_id().as_str(), "session-2");
        assert!(a.is_healthy());
        assert!(b.keep_alive());
        assert_eq!(daemon.session_count(), 2);
    }

    #[tokio::test]
    async fn test_discovery_resolves_through_pump() {
        let (daemon, rx) = daemon();
        let cancel = CancellationToken::new();
        let pump = daemon.spawn_event_pump(rx, cancel.clone());

        let session = daemon.open_session(None, false);
        let devices = session.discover_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(daemon.registry().unclaimed_devices().await.len(), 1);

        cancel.cancel();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_drop_without_keep_alive_forgets_session() {
        let (daemon, _rx) = daemon();
        let session = daemon.open_session(None, false);
        let id = session.session_id().clone();

        let outcome = daemon.on_transport_disconnected(&id).await;
        assert_eq!(outcome, Some(DisconnectOutcome::Terminated));
        assert!(session.is_closed());
        assert!(daemon.session(&id).is_none());
    }

    #[tokio::test]
    async fn test_resume_requires_matching_pid() {
        let (daemon, _rx) = daemon();
        let session = daemon.open_session(Some(10), true);
        let id = session.session_id().clone();

        // Still connected: nothing to resume
        assert!(daemon.resume_session(&id, Some(10)).is_none());

        assert_eq!(
            daemon.on_transport_disconnected(&id).await,
            Some(DisconnectOutcome::Retained)
        );
        assert!(daemon.resume_session(&id, Some(11)).is_none());
        assert!(daemon.resume_session(&id, Some(10)).is_some());
        assert!(session.flags().has(SessionFlags::CONNECTED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresumed_session_expires_after_grace() {
        let (daemon, _rx) = daemon();
        let session = daemon.open_session(None, true);
        let id = session.session_id().clone();

        daemon.on_transport_disconnected(&id).await;
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(session.is_closed());
        assert!(daemon.session(&id).is_none());
    }
}

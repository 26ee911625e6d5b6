//! Unix socket server for devmuxd.
//!
//! The server:
//! - Listens on a Unix socket for client connections
//! - Spawns a ConnectionHandler for each client
//! - Forwards registry device events to subscribed clients
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │                 │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│ ResourceDaemon  │
//! │   (per client)  │     │  ClientSession  │
//! └─────────────────┘     └─────────────────┘
//!         ▲
//!         │ DeviceEvent push (unless flow-paused)
//! ┌─────────────────┐
//! │ event forwarder │◀──── RegistryHandle::subscribe()
//! └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{ClientWriter, ConnectionError, ConnectionHandler, Outbox, SubscribersMap};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use devmux_core::SessionId;
use devmux_protocol::{DaemonMessage, DeviceEventKind};

use crate::daemon::ResourceDaemon;
use crate::registry::DeviceEvent;

/// Unix socket server for devmuxd.
pub struct DaemonServer {
    socket_path: PathBuf,

    daemon: Arc<ResourceDaemon>,

    cancel_token: CancellationToken,

    /// Connection counter for log correlation
    connection_counter: AtomicU64,

    /// Clients subscribed to device events
    subscribers: SubscribersMap,
}

impl DaemonServer {
    pub fn new(socket_path: impl Into<PathBuf>, daemon: Arc<ResourceDaemon>, cancel_token: CancellationToken) -> Self {
        Self {
            socket_path: socket_path.into(),
            daemon,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Runs the server until the cancellation token fires, then removes
    /// the socket file. Per-connection failures are logged, not returned.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        info!(socket = %self.socket_path.display(), "Daemon server listening");

        self.spawn_event_forwarder();

        loop {
            let accepted = tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _addr)) => {
                    let connection_number = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                    self.handle_connection(stream, connection_number);
                }
                Err(e) => error!(error = %e, "Failed to accept connection"),
            }
        }

        info!("Server shutdown requested");
        self.cleanup().await;
        Ok(())
    }

    /// Binds the socket, replacing a stale file left by an earlier run.
    fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!(socket = %self.socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(setup_error(e)),
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(setup_error)?;
        }

        UnixListener::bind(&self.socket_path).map_err(setup_error)
    }

    fn handle_connection(&self, stream: tokio::net::UnixStream, connection_number: u64) {
        let (reader, writer) = stream.into_split();
        let daemon = Arc::clone(&self.daemon);
        let subscribers = Arc::clone(&self.subscribers);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(
                reader,
                writer,
                daemon,
                Arc::clone(&subscribers),
                cancel_token,
                connection_number,
            );

            if let Some(session_id) = handler.run().await {
                if subscribers.write().await.remove(&session_id).is_some() {
                    debug!(session_id = %session_id, "Removed disconnected subscriber");
                }
            }
        });
    }

    /// Forwards registry events to every subscribed client.
    fn spawn_event_forwarder(&self) {
        let mut event_rx = self.daemon.registry().subscribe();
        let subscribers = Arc::clone(&self.subscribers);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Event forwarder shutting down");
                        break;
                    }

                    result = event_rx.recv() => {
                        match result {
                            Ok(event) => forward_event(&subscribers, &event).await,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Event forwarder lagged, skipped events");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Event channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    async fn cleanup(&self) {
        let dropped = {
            let mut subscribers = self.subscribers.write().await;
            let count = subscribers.len();
            subscribers.clear();
            count
        };

        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(socket = %self.socket_path.display(), error = %e, "Failed to remove socket file"),
        }

        info!(subscribers = dropped, "Server cleanup complete");
    }
}

/// Wire form of a registry event.
pub fn event_message(event: &DeviceEvent) -> DaemonMessage {
    match event {
        DeviceEvent::Discovered { device } => {
            DaemonMessage::device_event(DeviceEventKind::Discovered, device.device_id.clone(), None)
        }
        DeviceEvent::Claimed { device_id, owner } => {
            DaemonMessage::device_event(DeviceEventKind::Claimed, device_id.clone(), Some(owner.clone()))
        }
        DeviceEvent::Released { device_id } => {
            DaemonMessage::device_event(DeviceEventKind::Released, device_id.clone(), None)
        }
        DeviceEvent::Disconnected { device_id } => {
            DaemonMessage::device_event(DeviceEventKind::Disconnected, device_id.clone(), None)
        }
    }
}

/// Pushes one event to every subscriber, dropping the ones whose write fails.
async fn forward_event(subscribers: &SubscribersMap, event: &DeviceEvent) {
    let msg = event_message(event);

    let targets: Vec<(SessionId, Outbox)> = subscribers
        .read()
        .await
        .iter()
        .map(|(id, outbox)| (id.clone(), outbox.clone()))
        .collect();

    let mut failed = Vec::new();
    for (session_id, outbox) in targets {
        if let Err(e) = outbox.push(&msg).await {
            debug!(session_id = %session_id, error = %e, "Failed to push event to subscriber");
            failed.push(session_id);
        }
    }

    if !failed.is_empty() {
        let mut subs = subscribers.write().await;
        for session_id in failed {
            subs.remove(&session_id);
            debug!(session_id = %session_id, "Removed failed subscriber");
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmux_core::{DeviceId, DeviceDescriptor, DeviceType};

    #[test]
    fn test_server_error_display() {
        let err = ServerError::SocketSetup {
            path: PathBuf::from("/tmp/test.sock"),
            error: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/tmp/test.sock"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_event_message_mapping() {
        let desc = DeviceDescriptor::new(DeviceId::new("kbd-1"), DeviceType::Keyboard, ["raw"]);
        let msg = event_message(&DeviceEvent::Discovered {
            device: Box::new(desc),
        });
        assert_eq!(
            msg,
            DaemonMessage::device_event(DeviceEventKind::Discovered, DeviceId::new("kbd-1"), None)
        );

        let msg = event_message(&DeviceEvent::Claimed {
            device_id: DeviceId::new("kbd-1"),
            owner: SessionId::new("session-1"),
        });
        assert!(msg.is_push());
        assert!(matches!(
            msg,
            DaemonMessage::DeviceEvent {
                kind: DeviceEventKind::Claimed,
                session_id: Some(_),
                ..
            }
        ));
    }
}

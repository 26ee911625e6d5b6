//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs the handshake (protocol version check, open or resume session)
//! - Parses incoming line-delimited JSON messages
//! - Runs claims, releases and discoveries on background tasks so the
//!   read loop keeps serving pongs and acks while they are in flight
//! - Drives the session heartbeat
//! - Applies the session's disconnect policy when the transport drops
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devmux_core::{DeviceId, Mode, SessionId};
use devmux_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};

use crate::daemon::ResourceDaemon;
use crate::session::{ClientSession, HeartbeatCheck};

/// Shared write half of a client connection
pub type ClientWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// Subscribed clients, keyed by session
pub type SubscribersMap = Arc<RwLock<HashMap<SessionId, Outbox>>>;

/// Maximum number of concurrent event subscribers
pub(crate) const MAX_SUBSCRIBERS: usize = 64;

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Outbox
// ============================================================================

/// Write side of an authenticated connection.
///
/// Every message written counts against the session's unacknowledged
/// window; pushes are withheld while the session is flow-paused.
#[derive(Clone)]
pub struct Outbox {
    writer: ClientWriter,
    session: Arc<ClientSession>,
}

impl Outbox {
    pub fn new(writer: ClientWriter, session: Arc<ClientSession>) -> Self {
        Self { writer, session }
    }

    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }

    /// Sends a message and counts it as sent.
    pub async fn send(&self, msg: &DaemonMessage) -> Result<(), ConnectionError> {
        write_line(&self.writer, msg).await?;
        self.session.message_sent();
        Ok(())
    }

    /// Sends an unsolicited push unless the client is flow-paused.
    /// Returns false if the push was withheld.
    pub async fn push(&self, msg: &DaemonMessage) -> Result<bool, ConnectionError> {
        if self.session.is_flow_paused() {
            debug!(session_id = %self.session.session_id(), "Push withheld, client flow-paused");
            return Ok(false);
        }
        self.send(msg).await?;
        Ok(true)
    }
}

/// Writes one JSON line with the write timeout applied.
async fn write_line(writer: &ClientWriter, msg: &DaemonMessage) -> Result<(), ConnectionError> {
    let json = serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    let mut writer = writer.lock().await;

    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

// ============================================================================
// Connection Handler
// ============================================================================

/// Why the message loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Client sent `Disconnect`
    Requested,
    /// Daemon is shutting down
    Shutdown,
}

/// Connection handler for a single client.
pub struct ConnectionHandler {
    /// Incoming lines; `next_line` is cancel-safe inside `select!`
    lines: Lines<BufReader<OwnedReadHalf>>,

    writer: ClientWriter,

    daemon: Arc<ResourceDaemon>,

    subscribers: SubscribersMap,

    cancel_token: CancellationToken,

    /// Session bound by the handshake
    session: Option<Arc<ClientSession>>,

    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        daemon: Arc<ResourceDaemon>,
        subscribers: SubscribersMap,
        cancel_token: CancellationToken,
        connection_number: u64,
    ) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            daemon,
            subscribers,
            cancel_token,
            session: None,
            connection_number,
        }
    }

    /// Runs the connection until it closes. Returns the bound session id,
    /// if the handshake got that far.
    pub async fn run(mut self) -> Option<SessionId> {
        debug!(connection = self.connection_number, "New client connected");

        let outbox = match self.handle_handshake().await {
            Ok(outbox) => outbox,
            Err(e) => {
                warn!(connection = self.connection_number, error = %e, "Handshake failed");
                return None;
            }
        };
        let session_id = outbox.session().session_id().clone();
        info!(session_id = %session_id, connection = self.connection_number, "Client handshake completed");

        let exit = self.process_messages(&outbox).await;
        self.subscribers.write().await.remove(&session_id);

        match exit {
            Ok(Exit::Requested) => {
                info!(session_id = %session_id, "Client requested disconnect");
                self.daemon.close_session(&session_id).await;
            }
            Ok(Exit::Shutdown) => {
                debug!(session_id = %session_id, "Connection closed for daemon shutdown");
            }
            Err(e) => {
                if e.is_transport_drop() {
                    info!(session_id = %session_id, reason = %e, "Client transport lost");
                } else {
                    warn!(session_id = %session_id, reason = %e, "Dropping client connection");
                }
                self.daemon.on_transport_disconnected(&session_id).await;
            }
        }

        Some(session_id)
    }

    /// Expects `Connect`, checks the protocol version, then opens a new
    /// session or resumes a retained one.
    async fn handle_handshake(&mut self) -> Result<Outbox, ConnectionError> {
        let msg = self.read_message().await?;

        if ProtocolVersion::check_peer(&msg.protocol_version).is_err() {
            warn!(
                client_version = %msg.protocol_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            write_line(
                &self.writer,
                &DaemonMessage::rejected(&format!(
                    "Protocol version {} not compatible with server version {}",
                    msg.protocol_version,
                    ProtocolVersion::CURRENT
                )),
            )
            .await?;
            return Err(ConnectionError::VersionMismatch {
                client: msg.protocol_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        let (client_pid, keep_alive, resume_session) = match msg.message {
            MessageType::Connect {
                client_pid,
                keep_alive,
                resume_session,
            } => (client_pid, keep_alive, resume_session),
            other => {
                write_line(&self.writer, &DaemonMessage::error("Expected Connect message for handshake")).await?;
                return Err(ConnectionError::UnexpectedMessage(format!("{other:?}")));
            }
        };

        let (session, resumed) = match resume_session {
            Some(session_id) => match self.daemon.resume_session(&session_id, client_pid) {
                Some(session) => {
                    session.set_keep_alive(keep_alive);
                    (session, true)
                }
                None => {
                    write_line(
                        &self.writer,
                        &DaemonMessage::rejected(&format!("Session {session_id} cannot be resumed")),
                    )
                    .await?;
                    return Err(ConnectionError::ResumeRefused(session_id));
                }
            },
            None => (self.daemon.open_session(client_pid, keep_alive), false),
        };

        self.session = Some(Arc::clone(&session));
        let outbox = Outbox::new(Arc::clone(&self.writer), Arc::clone(&session));
        outbox
            .send(&DaemonMessage::connected(session.session_id().clone(), resumed))
            .await?;
        Ok(outbox)
    }

    /// Main loop: client messages, heartbeat ticks and daemon shutdown.
    async fn process_messages(&mut self, outbox: &Outbox) -> Result<Exit, ConnectionError> {
        let session = Arc::clone(outbox.session());
        let mut heartbeat = tokio::time::interval(session.settings().heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => return Ok(Exit::Shutdown),

                _ = heartbeat.tick() => {
                    if session.check_heartbeat() == HeartbeatCheck::TimedOut {
                        return Err(ConnectionError::HeartbeatTimeout);
                    }
                    let seq = session.send_ping();
                    outbox.send(&DaemonMessage::ping(seq)).await?;
                }

                line = self.lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => return Err(ConnectionError::Eof),
                        Err(e) => return Err(ConnectionError::Io(e.to_string())),
                    };
                    if line.trim().is_empty() {
                        continue;
                    }

                    let msg = match parse_message(&line) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(session_id = %session.session_id(), error = %e, "Bad client message");
                            outbox.send(&DaemonMessage::error(&e.to_string())).await?;
                            continue;
                        }
                    };

                    if let Some(exit) = self.handle_message(outbox, msg).await? {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    /// Handles a single client message. Returns `Some` to end the loop.
    async fn handle_message(&mut self, outbox: &Outbox, msg: ClientMessage) -> Result<Option<Exit>, ConnectionError> {
        let session = outbox.session();

        match msg.message {
            MessageType::Connect { .. } => {
                outbox.send(&DaemonMessage::error("Already connected")).await?;
            }

            MessageType::Discover => {
                let outbox = outbox.clone();
                tokio::spawn(async move {
                    let reply = match outbox.session().discover_devices().await {
                        Ok(devices) => DaemonMessage::device_list(devices),
                        Err(e) => DaemonMessage::Error {
                            message: e.to_string(),
                            code: Some(e.code().to_string()),
                            device_id: None,
                        },
                    };
                    send_reply(&outbox, reply).await;
                });
            }

            MessageType::ListDevices { unclaimed_only } => {
                let registry = self.daemon.registry();
                let devices = if unclaimed_only {
                    registry.unclaimed_devices().await
                } else {
                    registry.all_devices().await
                };
                outbox.send(&DaemonMessage::device_list(devices)).await?;
            }

            MessageType::Claim {
                device_id,
                mode,
                timeout_ms,
            } => {
                spawn_claim(outbox.clone(), device_id, mode, timeout_ms.map(Duration::from_millis));
            }

            MessageType::Release { device_id } => {
                let outbox = outbox.clone();
                tokio::spawn(async move {
                    let reply = match outbox.session().release(device_id.clone()).await {
                        Ok(()) => DaemonMessage::released(device_id),
                        Err(e) => DaemonMessage::device_error(device_id, e.code(), &e.to_string()),
                    };
                    send_reply(&outbox, reply).await;
                });
            }

            MessageType::Status => {
                outbox.send(&DaemonMessage::status(session.status_view())).await?;
            }

            MessageType::Subscribe => {
                let session_id = session.session_id().clone();
                {
                    let mut subs = self.subscribers.write().await;
                    if subs.len() >= MAX_SUBSCRIBERS && !subs.contains_key(&session_id) {
                        drop(subs);
                        outbox
                            .send(&DaemonMessage::error(&format!(
                                "Too many subscribers (max: {MAX_SUBSCRIBERS})"
                            )))
                            .await?;
                        return Ok(None);
                    }
                    subs.insert(session_id.clone(), outbox.clone());
                }
                debug!(session_id = %session_id, "Client subscribed to device events");

                // Current catalog as initial state
                let devices = self.daemon.registry().all_devices().await;
                outbox.send(&DaemonMessage::device_list(devices)).await?;
            }

            MessageType::Unsubscribe => {
                self.subscribers.write().await.remove(session.session_id());
                debug!(session_id = %session.session_id(), "Client unsubscribed from device events");
            }

            MessageType::Ping { seq } => {
                outbox.send(&DaemonMessage::pong(seq)).await?;
            }

            MessageType::Pong { seq } => {
                debug!(session_id = %session.session_id(), seq, "Pong received");
                session.received_pong();
            }

            MessageType::Ack { count } => {
                session.messages_acknowledged(count);
            }

            MessageType::Disconnect => return Ok(Some(Exit::Requested)),
        }

        Ok(None)
    }

    /// Reads a single message (used for the handshake).
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| ConnectionError::Io(e.to_string()))?
                .ok_or(ConnectionError::Eof)?;
            if !line.trim().is_empty() {
                return parse_message(&line);
            }
        }
    }

    /// Returns the session bound by the handshake.
    pub fn session(&self) -> Option<&Arc<ClientSession>> {
        self.session.as_ref()
    }
}

fn parse_message(line: &str) -> Result<ClientMessage, ConnectionError> {
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(ConnectionError::MessageTooLarge {
            size: line.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    serde_json::from_str(line).map_err(|e| ConnectionError::ParseError(e.to_string()))
}

fn spawn_claim(outbox: Outbox, device_id: DeviceId, mode: Mode, timeout: Option<Duration>) {
    tokio::spawn(async move {
        let reply = match outbox.session().claim(device_id.clone(), mode.clone(), timeout).await {
            Ok(resource) => DaemonMessage::claimed(
                device_id,
                resource.device_path().clone(),
                resource.active_mode().unwrap_or(mode),
            ),
            Err(e) => DaemonMessage::device_error(device_id, e.code(), &e.to_string()),
        };
        send_reply(&outbox, reply).await;
    });
}

/// Replies from background tasks; a failed write means the read loop is
/// about to see the transport drop, so it is only logged.
async fn send_reply(outbox: &Outbox, reply: DaemonMessage) {
    if let Err(e) = outbox.send(&reply).await {
        debug!(session_id = %outbox.session().session_id(), error = %e, "Failed to deliver reply");
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Session {0} cannot be resumed")]
    ResumeRefused(SessionId),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

impl ConnectionError {
    /// True for a plain transport drop, as opposed to a protocol or
    /// liveness failure.
    pub fn is_transport_drop(&self) -> bool {
        matches!(self, Self::Eof | Self::Io(_) | Self::WriteTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_parse_message_limits() {
        let big = "x".repeat(MAX_MESSAGE_SIZE + 1);
        assert!(matches!(
            parse_message(&big),
            Err(ConnectionError::MessageTooLarge { .. })
        ));
        assert!(matches!(parse_message("{not json"), Err(ConnectionError::ParseError(_))));

        let msg = parse_message(r#"{"protocol_version":{"major":1,"minor":0},"type":"status"}"#).unwrap();
        assert_eq!(msg.message, MessageType::Status);
    }

    #[test]
    fn test_transport_drop_classification() {
        assert!(ConnectionError::Eof.is_transport_drop());
        assert!(!ConnectionError::HeartbeatTimeout.is_transport_drop());
    }
}

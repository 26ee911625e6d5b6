//! Integration tests for the Unix socket server.
//!
//! These tests run the full daemon stack (server, sessions, registry and
//! the loopback hardware backend) and drive it through real socket clients.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use devmux_core::{DeviceDescriptor, DeviceId, DeviceType, SessionId};
use devmux_protocol::{ClientMessage, DaemonMessage, DeviceEventKind, MessageType, ProtocolVersion};
use devmuxd::backend::LoopbackBackend;
use devmuxd::daemon::ResourceDaemon;
use devmuxd::registry::spawn_registry;
use devmuxd::server::DaemonServer;
use devmuxd::session::SessionSettings;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for server socket to appear
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between socket existence checks
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on any single reply
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace period for server shutdown
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

// ============================================================================
// Test Helpers
// ============================================================================

/// Test server context that manages server lifecycle and cleanup.
struct TestServer {
    socket_path: PathBuf,
    daemon: Arc<ResourceDaemon>,
    cancel_token: CancellationToken,
    _temp_dir: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("devmux.sock");

        let inventory = vec![
            DeviceDescriptor::new(DeviceId::new("kbd-1"), DeviceType::Keyboard, ["raw", "parsed"]),
            DeviceDescriptor::new(DeviceId::new("pad-1"), DeviceType::Hid, ["raw"]),
        ];
        let (events_tx, events_rx) = mpsc::channel(64);
        let backend = Arc::new(LoopbackBackend::new(inventory.clone(), events_tx));
        let daemon = ResourceDaemon::new(
            spawn_registry(),
            backend,
            SessionSettings::default(),
            Duration::from_secs(30),
        );
        daemon.on_device_list_updated(inventory).await;

        let cancel_token = CancellationToken::new();
        daemon.spawn_event_pump(events_rx, cancel_token.clone());

        let server = DaemonServer::new(socket_path.clone(), Arc::clone(&daemon), cancel_token.clone());
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT {
            if socket_path.exists() {
                break;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        Self {
            socket_path,
            daemon,
            cancel_token,
            _temp_dir: temp_dir,
        }
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }

    /// Connects and completes a fresh-session handshake.
    async fn client(&self) -> (TestClient, SessionId) {
        let mut client = self.connect().await;
        let session_id = client.handshake(ClientMessage::connect(None, false)).await;
        (client, session_id)
    }

    async fn shutdown(self) {
        self.cancel_token.cancel();
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

/// Test client connection with protocol helpers.
struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.writer.write_all(json.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next message that is not a daemon heartbeat ping.
    async fn recv(&mut self) -> DaemonMessage {
        loop {
            let mut line = String::new();
            let read = timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
                .await
                .expect("reply within timeout")
                .unwrap();
            assert!(read > 0, "connection closed by server");
            match serde_json::from_str(&line).unwrap() {
                DaemonMessage::Ping { .. } => continue,
                msg => return msg,
            }
        }
    }

    /// Reads until `pred` matches, skipping unrelated pushes.
    async fn recv_until(&mut self, pred: impl Fn(&DaemonMessage) -> bool) -> DaemonMessage {
        loop {
            let msg = self.recv().await;
            if pred(&msg) {
                return msg;
            }
        }
    }

    async fn handshake(&mut self, connect: ClientMessage) -> SessionId {
        self.send(connect).await;
        match self.recv().await {
            DaemonMessage::Connected { session_id, .. } => session_id,
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    async fn claim(&mut self, device: &str) -> DaemonMessage {
        self.send(ClientMessage::claim(device, "raw")).await;
        self.recv_until(|m| matches!(m, DaemonMessage::Claimed { .. } | DaemonMessage::Error { .. }))
            .await
    }

    /// Subscribes and consumes the initial device list.
    async fn subscribe(&mut self) {
        self.send(ClientMessage::subscribe()).await;
        match self.recv().await {
            DaemonMessage::DeviceList { .. } => {}
            other => panic!("Expected DeviceList, got {other:?}"),
        }
    }

    async fn wait_for_event(&mut self, kind: DeviceEventKind, device: &str) -> Option<SessionId> {
        let device = DeviceId::new(device);
        match self
            .recv_until(|m| {
                matches!(m, DaemonMessage::DeviceEvent { kind: k, device_id, .. } if *k == kind && *device_id == device)
            })
            .await
        {
            DaemonMessage::DeviceEvent { session_id, .. } => session_id,
            _ => None,
        }
    }
}

// ============================================================================
// Handshake Tests
// ============================================================================

#[tokio::test]
async fn test_handshake_opens_session() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send(ClientMessage::connect(Some(4242), false)).await;
    match client.recv().await {
        DaemonMessage::Connected {
            protocol_version,
            session_id,
            resumed,
        } => {
            assert_eq!(protocol_version, ProtocolVersion::CURRENT);
            assert_eq!(session_id.as_str(), "session-1");
            assert!(!resumed);
        }
        other => panic!("Expected Connected, got {other:?}"),
    }

    let session = server.daemon.session(&SessionId::new("session-1")).unwrap();
    assert_eq!(session.client_pid(), Some(4242));
    assert!(session.is_healthy());

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_version_mismatch() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(ClientMessage {
            protocol_version: ProtocolVersion::new(99, 0),
            message: MessageType::Connect {
                client_pid: None,
                keep_alive: false,
                resume_session: None,
            },
        })
        .await;

    match client.recv().await {
        DaemonMessage::Rejected { reason, .. } => {
            assert!(reason.contains("not compatible"), "unexpected reason: {reason}");
        }
        other => panic!("Expected Rejected, got {other:?}"),
    }
    assert_eq!(server.daemon.session_count(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_requires_connect() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send(ClientMessage::status()).await;
    assert!(matches!(client.recv().await, DaemonMessage::Error { .. }));

    server.shutdown().await;
}

#[tokio::test]
async fn test_resume_of_unknown_session_rejected() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(ClientMessage::resume(SessionId::new("session-77"), None))
        .await;
    assert!(matches!(client.recv().await, DaemonMessage::Rejected { .. }));

    server.shutdown().await;
}

// ============================================================================
// Device Operations
// ============================================================================

#[tokio::test]
async fn test_list_and_discover_devices() {
    let server = TestServer::spawn().await;
    let (mut client, _) = server.client().await;

    client.send(ClientMessage::list_devices(false)).await;
    match client.recv().await {
        DaemonMessage::DeviceList { devices } => assert_eq!(devices.len(), 2),
        other => panic!("Expected DeviceList, got {other:?}"),
    }

    client.send(ClientMessage::discover()).await;
    match client.recv().await {
        DaemonMessage::DeviceList { devices } => {
            let ids: Vec<_> = devices.iter().map(|d| d.device_id.as_str().to_string()).collect();
            assert_eq!(ids, vec!["kbd-1", "pad-1"]);
        }
        other => panic!("Expected DeviceList, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_claim_status_release_over_socket() {
    let server = TestServer::spawn().await;
    let (mut client, session_id) = server.client().await;

    match client.claim("kbd-1").await {
        DaemonMessage::Claimed {
            device_id,
            device_path,
            mode,
        } => {
            assert_eq!(device_id.as_str(), "kbd-1");
            assert_eq!(device_path.as_str(), format!("/sessions/{session_id}/devices/kbd-1"));
            assert_eq!(mode.as_str(), "raw");
        }
        other => panic!("Expected Claimed, got {other:?}"),
    }

    client.send(ClientMessage::list_devices(true)).await;
    match client.recv().await {
        DaemonMessage::DeviceList { devices } => {
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].device_id.as_str(), "pad-1");
        }
        other => panic!("Expected DeviceList, got {other:?}"),
    }

    client.send(ClientMessage::status()).await;
    match client.recv().await {
        DaemonMessage::Status { status } => {
            assert_eq!(status.session_id, session_id);
            assert_eq!(status.claimed_devices, vec![DeviceId::new("kbd-1")]);
            assert!(status.flags.contains(&"has_claimed_resources".to_string()));
            assert!(status.healthy);
        }
        other => panic!("Expected Status, got {other:?}"),
    }

    client.send(ClientMessage::release("kbd-1")).await;
    assert_eq!(
        client.recv().await,
        DaemonMessage::released(DeviceId::new("kbd-1"))
    );
    assert!(server.daemon.claims().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_second_client_gets_conflict() {
    let server = TestServer::spawn().await;
    let (mut owner, _) = server.client().await;
    let (mut other, _) = server.client().await;

    assert!(matches!(owner.claim("kbd-1").await, DaemonMessage::Claimed { .. }));

    match other.claim("kbd-1").await {
        DaemonMessage::Error { code, device_id, .. } => {
            assert_eq!(code.as_deref(), Some("conflict"));
            assert_eq!(device_id, Some(DeviceId::new("kbd-1")));
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    match other.claim("ghost").await {
        DaemonMessage::Error { code, .. } => assert_eq!(code.as_deref(), Some("unknown_device")),
        other => panic!("Expected Error, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_ping_pong() {
    let server = TestServer::spawn().await;
    let (mut client, _) = server.client().await;

    client.send(ClientMessage::ping(7)).await;
    assert_eq!(client.recv().await, DaemonMessage::pong(7));

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_line_keeps_connection() {
    let server = TestServer::spawn().await;
    let (mut client, _) = server.client().await;

    client.writer.write_all(b"{not json}\n").await.unwrap();
    assert!(matches!(client.recv().await, DaemonMessage::Error { .. }));

    client.send(ClientMessage::ping(1)).await;
    assert_eq!(client.recv().await, DaemonMessage::pong(1));

    server.shutdown().await;
}

// ============================================================================
// Events and Disconnects
// ============================================================================

#[tokio::test]
async fn test_subscriber_sees_claim_events() {
    let server = TestServer::spawn().await;
    let (mut watcher, _) = server.client().await;
    watcher.subscribe().await;

    let (mut owner, owner_id) = server.client().await;
    assert!(matches!(owner.claim("pad-1").await, DaemonMessage::Claimed { .. }));

    let holder = watcher.wait_for_event(DeviceEventKind::Claimed, "pad-1").await;
    assert_eq!(holder, Some(owner_id));

    owner.send(ClientMessage::release("pad-1")).await;
    watcher.wait_for_event(DeviceEventKind::Released, "pad-1").await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_releases_claims() {
    let server = TestServer::spawn().await;
    let (mut watcher, _) = server.client().await;
    watcher.subscribe().await;

    let (mut owner, owner_id) = server.client().await;
    assert!(matches!(owner.claim("kbd-1").await, DaemonMessage::Claimed { .. }));

    owner.send(ClientMessage::disconnect()).await;
    watcher.wait_for_event(DeviceEventKind::Released, "kbd-1").await;

    assert!(matches!(watcher.claim("kbd-1").await, DaemonMessage::Claimed { .. }));

    // Graceful close forgets the session once its releases are done
    for _ in 0..50 {
        if server.daemon.session(&owner_id).is_none() {
            break;
        }
        sleep(SOCKET_POLL_INTERVAL).await;
    }
    assert!(server.daemon.session(&owner_id).is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn test_transport_drop_releases_claims() {
    let server = TestServer::spawn().await;
    let (mut watcher, _) = server.client().await;
    watcher.subscribe().await;

    let (mut owner, _) = server.client().await;
    assert!(matches!(owner.claim("kbd-1").await, DaemonMessage::Claimed { .. }));

    drop(owner);
    watcher.wait_for_event(DeviceEventKind::Released, "kbd-1").await;
    assert!(server.daemon.claims().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_keep_alive_session_resumes_with_claims() {
    let server = TestServer::spawn().await;

    let mut first = server.connect().await;
    let session_id = first.handshake(ClientMessage::connect(Some(42), true)).await;
    assert!(matches!(first.claim("kbd-1").await, DaemonMessage::Claimed { .. }));
    drop(first);

    // Resume is refused until the daemon has seen the drop
    let mut resumed = None;
    for _ in 0..50 {
        let mut client = server.connect().await;
        client
            .send(ClientMessage::resume(session_id.clone(), Some(42)))
            .await;
        match client.recv().await {
            DaemonMessage::Connected {
                session_id: id,
                resumed: true,
                ..
            } => {
                assert_eq!(id, session_id);
                resumed = Some(client);
                break;
            }
            DaemonMessage::Rejected { .. } => sleep(SOCKET_POLL_INTERVAL).await,
            other => panic!("Expected Connected or Rejected, got {other:?}"),
        }
    }
    let mut client = resumed.expect("session resumed");

    client.send(ClientMessage::status()).await;
    match client.recv().await {
        DaemonMessage::Status { status } => {
            assert_eq!(status.claimed_devices, vec![DeviceId::new("kbd-1")]);
            assert!(status.keep_alive);
        }
        other => panic!("Expected Status, got {other:?}"),
    }

    server.shutdown().await;
}

//! devmux daemon - exclusive input device claims for local clients
//!
//! This binary runs as a background daemon. Clients connect over a Unix
//! socket, open a session, and claim keyboards or HID devices for exclusive
//! use; claims are released when the client asks or when it goes away.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! devmuxd start
//!
//! # Start the daemon (background) with an explicit config file
//! devmuxd start -d --config ~/.config/devmux/devmuxd.toml
//!
//! # Stop the daemon
//! devmuxd stop
//!
//! # Check daemon status
//! devmuxd status
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use devmuxd::backend::{DeviceBackend, LoopbackBackend};
use devmuxd::config::DaemonConfig;
use devmuxd::daemon::ResourceDaemon;
use devmuxd::registry::spawn_registry;
use devmuxd::server::DaemonServer;

/// Capacity of the hardware event channel
const BACKEND_EVENT_CAPACITY: usize = 256;

/// How long `stop` waits for the daemon to exit
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// devmux daemon - session-scoped input device claims
#[derive(Parser, Debug)]
#[command(name = "devmuxd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (defaults to $XDG_CONFIG_HOME/devmux/devmuxd.toml)
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status {
        /// Config file used to locate the socket
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
    },
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("devmux")
}

/// PID file of the running daemon, `$XDG_STATE_HOME/devmux/devmuxd.pid`.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn locate() -> Self {
        Self {
            path: state_dir().join("devmuxd.pid"),
        }
    }

    fn read(&self) -> Option<u32> {
        let mut contents = String::new();
        File::open(&self.path).ok()?.read_to_string(&mut contents).ok()?;
        contents.trim().parse().ok()
    }

    fn write_current(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        let mut file = File::create(&self.path).context("Failed to create PID file")?;
        write!(file, "{}", process::id()).context("Failed to write PID")?;
        Ok(())
    }

    fn remove(&self) {
        let _ = fs::remove_file(&self.path);
    }

    /// PID of a live daemon. A stale file is cleaned up.
    fn running(&self) -> Option<u32> {
        let pid = self.read()?;
        if is_process_running(pid) {
            return Some(pid);
        }
        self.remove();
        None
    }
}

fn is_process_running(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

fn send_sigterm(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

/// Polls until `pid` exits or `timeout` passes.
fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_process_running(pid) {
            return true;
        }
        std::thread::sleep(STOP_POLL_INTERVAL);
    }
    !is_process_running(pid)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let pid_file = PidFile::locate();

    match args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    }) {
        Command::Start { daemon, config } => {
            if let Some(pid) = pid_file.running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'devmuxd stop' to stop it first.");
                process::exit(1);
            }

            // Load before forking so config errors reach the terminal
            let config = DaemonConfig::load(config.as_deref()).context("Failed to load configuration")?;

            if daemon {
                daemonize()?;
            }

            pid_file.write_current()?;
            let result = run_daemon(config);
            pid_file.remove();
            result
        }
        Command::Stop => {
            let Some(pid) = pid_file.running() else {
                println!("Daemon is not running.");
                return Ok(());
            };

            println!("Stopping daemon (PID {pid})...");
            send_sigterm(pid)?;

            if wait_for_exit(pid, STOP_TIMEOUT) {
                println!("Daemon stopped.");
                Ok(())
            } else {
                eprintln!("Daemon did not stop within {} seconds.", STOP_TIMEOUT.as_secs());
                process::exit(1);
            }
        }
        Command::Status { config } => {
            let Some(pid) = pid_file.running() else {
                println!("Daemon is not running.");
                process::exit(1);
            };

            println!("Daemon is running (PID {pid})");
            if let Ok(config) = DaemonConfig::load(config.as_deref()) {
                print_socket(&config.socket_path);
            }
            Ok(())
        }
    }
}

fn print_socket(socket_path: &Path) {
    if socket_path.exists() {
        println!("Socket: {}", socket_path.display());
    }
}

/// Forks into the background with stdout/stderr going to
/// `$XDG_STATE_HOME/devmux/devmuxd.log`.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = state_dir().join("devmuxd.log");

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("devmuxd=info".parse()?)
                .add_directive("devmux_core=info".parse()?)
                .add_directive("devmux_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "devmux daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let registry = spawn_registry();
    info!("Device registry started");

    let inventory = config.inventory()?;
    let (events_tx, events_rx) = mpsc::channel(BACKEND_EVENT_CAPACITY);
    let backend: Arc<dyn DeviceBackend> = Arc::new(LoopbackBackend::new(inventory, events_tx));

    let daemon = ResourceDaemon::new(
        registry,
        Arc::clone(&backend),
        config.session_settings(),
        config.reconnect_grace(),
    );
    // Outlives the server so shutdown releases still get confirmed
    let pump_token = CancellationToken::new();
    let pump_handle = daemon.spawn_event_pump(events_rx, pump_token.clone());

    if let Err(e) = backend.request_discovery().await {
        warn!(error = %e, "Initial device discovery failed");
    }

    let server = DaemonServer::new(config.socket_path.clone(), Arc::clone(&daemon), cancel_token);

    info!(socket = %config.socket_path.display(), "Starting server");

    let result = server.run().await;

    daemon.shutdown_all().await;
    pump_token.cancel();
    let _ = pump_handle.await;

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("devmux daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

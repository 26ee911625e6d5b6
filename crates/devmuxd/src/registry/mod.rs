//! Device registry using the Actor pattern.
//!
//! The registry is the process-wide catalog of discovered devices, shared by
//! every session. It receives commands via a tokio mpsc channel and
//! publishes catalog changes on a broadcast channel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │ ResourceDaemon  │────▶│  RegistryActor  │────▶│ Broadcast Channel│
//! │ ClientSessions  │     │                 │     │                  │
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                       │                       │
//!         │   RegistryCommand     │   DeviceEvent         │
//!         │   (mpsc channel)      │   (broadcast)         │
//!         ▼                       ▼                       ▼
//!   discover / mark         HashMap<DeviceId,       Subscribed clients
//!   claimed / released      DeviceDescriptor>
//! ```
//!
//! The registry records claim status but does not arbitrate claims; that is
//! the claim table's job.

use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;

pub use actor::{RegistryActor, MAX_DEVICES};
pub use commands::{DeviceEvent, RegistryCommand, RegistryError};
pub use handle::RegistryHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 256;

/// Spawn the registry actor and return a handle for interaction.
///
/// # Example
///
/// ```no_run
/// use devmuxd::registry::spawn_registry;
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry();
///     let devices = handle.all_devices().await;
/// }
/// ```
pub fn spawn_registry() -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::new(cmd_rx, event_tx.clone());
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx, event_tx)
}

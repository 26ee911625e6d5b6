//! devmuxd - session-scoped input device claims
//!
//! This crate provides the daemon that mediates exclusive access to input
//! devices (keyboards, HID devices) for concurrent local client sessions:
//! - `registry` - Device catalog actor shared by every session
//! - `claims` / `resource` - Global claim table and the claimed resources in it
//! - `session` - Per-client coordinator (claim/release protocols, liveness)
//! - `daemon` - Parent coordinator routing hardware confirmations to sessions
//! - `backend` - Interface to the hardware daemon, plus a loopback stand-in
//! - `server` - Unix socket server for client connections
//! - `config` - TOML configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        devmuxd                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  DaemonServer   │────▶│      ResourceDaemon         │   │
//! │  │ (Unix Socket)   │     │  sessions + ClaimTable      │   │
//! │  └────────┬────────┘     └──────┬───────────────▲──────┘   │
//! │           │                     │               │           │
//! │           │ per client          │ requests      │ confirms  │
//! │           ▼                     ▼               │           │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ConnectionHandler│     │  DeviceBackend (hardware)   │   │
//! │  │ ClientSession   │     └─────────────────────────────┘   │
//! │  └─────────────────┘                                        │
//! │           ▲            ┌─────────────────────────────┐     │
//! │           └────────────│  RegistryActor (catalog)    │     │
//! │             events     └─────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod backend;
pub mod claims;
pub mod config;
pub mod daemon;
pub mod registry;
pub mod resource;
pub mod server;
pub mod session;

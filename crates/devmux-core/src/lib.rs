//! devmux Core - Shared types for session-scoped device claims
//!
//! This crate provides the domain types shared between the daemon
//! (devmuxd) and its local clients:
//! - device identity, type, operating modes and catalog descriptors
//! - session identity
//! - the reactive session flag set that drives session state cascades
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod device;
pub mod error;
pub mod flags;
pub mod session;

// Re-exports for convenience
pub use device::{DeviceDescriptor, DeviceId, DevicePath, DeviceType, Mode};
pub use error::{DomainError, DomainResult};
pub use flags::{FlagListener, FlagTransition, ReactiveFlagSet, SessionFlags};
pub use session::{SessionId, SessionStatusView};

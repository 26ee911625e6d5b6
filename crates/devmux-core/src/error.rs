//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur while building or validating domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was empty or contained characters that would break
    /// hierarchical device paths.
    #[error("Invalid {kind} identifier: {value:?}")]
    InvalidIdentifier { kind: &'static str, value: String },

    /// Unknown device type label
    #[error("Unknown device type: {0}")]
    UnknownDeviceType(String),

    /// A descriptor advertised no operating modes
    #[error("Device {device_id} advertises no capabilities")]
    NoCapabilities { device_id: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

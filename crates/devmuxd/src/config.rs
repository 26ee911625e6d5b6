//! Daemon configuration.
//!
//! Loaded from TOML, either the path given on the command line or
//! `$XDG_CONFIG_HOME/devmux/devmuxd.toml`. A missing default file means
//! built-in defaults; a missing explicit file is an error.
//!
//! ```toml
//! socket_path = "/tmp/devmux.sock"
//!
//! [session]
//! heartbeat_interval_ms = 10000
//! heartbeat_timeout_ms = 5000
//! max_unacknowledged = 64
//! claim_timeout_ms = 5000
//! release_timeout_ms = 3000
//! discovery_timeout_ms = 5000
//! reconnect_grace_ms = 30000
//!
//! [[devices]]
//! id = "kbd-1"
//! device_type = "keyboard"
//! capabilities = ["raw", "parsed"]
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use devmux_core::{DeviceDescriptor, DeviceId, DeviceType, DomainError};

use crate::session::SessionSettings;

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/devmux.sock";

/// Environment variable overriding `socket_path`
pub const SOCKET_ENV: &str = "DEVMUX_SOCKET";

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub session: SessionConfig,
    /// Inventory reported by the loopback backend
    pub devices: Vec<DeviceConfig>,
}

/// `[session]` table: per-session timing and flow control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub max_unacknowledged: u64,
    pub claim_timeout_ms: u64,
    pub release_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    pub reconnect_grace_ms: u64,
}

/// One `[[devices]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    pub capabilities: Vec<String>,
}

fn default_device_type() -> String {
    DeviceType::Other.label().to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            session: SessionConfig::default(),
            devices: vec![DeviceConfig {
                id: "kbd-1".to_string(),
                device_type: DeviceType::Keyboard.label().to_string(),
                capabilities: vec!["raw".to_string(), "parsed".to_string()],
            }],
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 5_000,
            max_unacknowledged: 64,
            claim_timeout_ms: 5_000,
            release_timeout_ms: 3_000,
            discovery_timeout_ms: 5_000,
            reconnect_grace_ms: 30_000,
        }
    }
}

impl DaemonConfig {
    /// Default config file location, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("devmux").join("devmuxd.toml"))
    }

    /// Loads, applies the environment override and validates.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if an explicit file is missing or unreadable,
    /// the TOML is malformed, or a value is out of range.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    debug!("No config file, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_socket_override(std::env::var(SOCKET_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file without validating it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        let config = Self::from_toml_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Replaces the socket path when the override is set and non-empty.
    pub fn apply_socket_override(&mut self, socket: Option<String>) {
        if let Some(socket) = socket.filter(|s| !s.trim().is_empty()) {
            self.socket_path = PathBuf::from(socket);
        }
    }

    /// Checks value ranges and the device inventory.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.session;
        let timeouts = [
            ("heartbeat_interval_ms", s.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", s.heartbeat_timeout_ms),
            ("claim_timeout_ms", s.claim_timeout_ms),
            ("release_timeout_ms", s.release_timeout_ms),
            ("discovery_timeout_ms", s.discovery_timeout_ms),
            ("reconnect_grace_ms", s.reconnect_grace_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if s.max_unacknowledged < 2 {
            return Err(ConfigError::Invalid(
                "max_unacknowledged must be at least 2".to_string(),
            ));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("socket_path must not be empty".to_string()));
        }

        self.inventory().map(|_| ())
    }

    pub fn session_settings(&self) -> SessionSettings {
        let s = &self.session;
        SessionSettings {
            heartbeat_interval: Duration::from_millis(s.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(s.heartbeat_timeout_ms),
            max_unacknowledged: s.max_unacknowledged,
            claim_timeout: Duration::from_millis(s.claim_timeout_ms),
            release_timeout: Duration::from_millis(s.release_timeout_ms),
            discovery_timeout: Duration::from_millis(s.discovery_timeout_ms),
        }
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.session.reconnect_grace_ms)
    }

    /// Builds validated descriptors from the `[[devices]]` entries.
    ///
    /// # Errors
    ///
    /// `ConfigError::Device` for a bad id, an unknown type or an empty
    /// capability list; `ConfigError::Invalid` for a duplicate id.
    pub fn inventory(&self) -> Result<Vec<DeviceDescriptor>, ConfigError> {
        let mut seen = std::collections::HashSet::new();
        let mut devices = Vec::with_capacity(self.devices.len());

        for entry in &self.devices {
            let device_id = DeviceId::parse(&entry.id)?;
            if !seen.insert(device_id.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate device id {device_id}")));
            }
            let device_type: DeviceType = entry.device_type.parse()?;
            let descriptor = DeviceDescriptor::new(device_id, device_type, entry.capabilities.iter().map(String::as_str));
            descriptor.validate()?;
            devices.push(descriptor);
        }

        Ok(devices)
    }
}

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Invalid device entry: {0}")]
    Device(#[from] DomainError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.socket_path, PathBuf::from("/tmp/devmux.sock"));

        let settings = config.session_settings();
        assert_eq!(settings, SessionSettings::default());
        assert_eq!(config.reconnect_grace(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_partial_file() {
        let config = DaemonConfig::from_toml_str(
            r#"
            socket_path = "/run/devmux.sock"

            [session]
            claim_timeout_ms = 250

            [[devices]]
            id = "pad-1"
            device_type = "hid"
            capabilities = ["raw"]
            "#,
        )
        .unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/run/devmux.sock"));
        assert_eq!(config.session.claim_timeout_ms, 250);
        assert_eq!(config.session.release_timeout_ms, 3_000);

        let inventory = config.inventory().unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].device_type, DeviceType::Hid);
    }

    #[test]
    fn test_rejects_unknown_keys() {
        assert!(DaemonConfig::from_toml_str("sockt_path = \"/tmp/x\"").is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[session\n").unwrap();
        assert!(matches!(DaemonConfig::from_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = DaemonConfig::default();
        config.session.claim_timeout_ms = 0;
        assert!(config.validate().unwrap_err().to_string().contains("claim_timeout_ms"));

        let mut config = DaemonConfig::default();
        config.session.max_unacknowledged = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_inventory() {
        let mut config = DaemonConfig::default();
        config.devices.push(config.devices[0].clone());
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));

        let mut config = DaemonConfig::default();
        config.devices[0].capabilities.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Device(_))));

        let mut config = DaemonConfig::default();
        config.devices[0].device_type = "joystick".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Device(_))));
    }

    #[test]
    fn test_socket_override() {
        let mut config = DaemonConfig::default();
        config.apply_socket_override(Some("  ".to_string()));
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));

        config.apply_socket_override(Some("/tmp/other.sock".to_string()));
        assert_eq!(config.socket_path, PathBuf::from("/tmp/other.sock"));
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaemonConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devmuxd.toml");
        std::fs::write(&path, "[session]\nmax_unacknowledged = 8\n").unwrap();

        let config = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(config.session.max_unacknowledged, 8);
        assert_eq!(config.devices.len(), 1);
    }
}

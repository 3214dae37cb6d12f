//! Server configuration.
//!
//! All values arrive through CLI flags (parsed by the `kvsd` binary);
//! this crate only owns the validated value object and its defaults so
//! that every component sees one configuration type.

use crate::consts::{
    DEFAULT_COMMAND_PORT, DEFAULT_HTTP_PORT, DEFAULT_SNAPSHOT_INTERVAL_SECS,
    DEFAULT_STORAGE_BYTES, DEFAULT_STORAGE_ENTRIES, DEFAULT_STORAGE_FILE, DEFAULT_WEB_ROOT,
};
use std::path::PathBuf;
use thiserror::Error;

/// Error type for configuration validation.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Complete server configuration with baked-in defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port of the line command protocol.
    pub command_port: u16,
    /// TCP port of the HTTP adapter.
    pub http_port: u16,
    /// Whether the HTTP adapter is started.
    pub enable_http: bool,
    /// Whether the pub/sub newsletter module is started.
    pub enable_newsletter: bool,
    /// Whether the OP executor command is registered.
    pub enable_exec: bool,
    /// Snapshot interval in seconds; 0 disables the snapshot worker.
    pub snapshot_interval_secs: u64,
    /// Number of records the storage map is sized for at startup.
    pub initial_storage_entries: usize,
    /// Initial shared-heap capacity in bytes.
    pub initial_storage_bytes: usize,
    /// Directory served by the HTTP adapter outside `/storage/`.
    pub web_root: PathBuf,
    /// CSV snapshot file path.
    pub storage_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command_port: DEFAULT_COMMAND_PORT,
            http_port: DEFAULT_HTTP_PORT,
            enable_http: true,
            enable_newsletter: true,
            enable_exec: true,
            snapshot_interval_secs: DEFAULT_SNAPSHOT_INTERVAL_SECS,
            initial_storage_entries: DEFAULT_STORAGE_ENTRIES,
            initial_storage_bytes: DEFAULT_STORAGE_BYTES,
            web_root: PathBuf::from(DEFAULT_WEB_ROOT),
            storage_file: PathBuf::from(DEFAULT_STORAGE_FILE),
        }
    }
}

impl ServerConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - the command and HTTP ports collide while HTTP is enabled
    /// - `initial_storage_entries` is zero
    /// - `initial_storage_bytes` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enable_http && self.command_port == self.http_port {
            return Err(ConfigError::ValidationError(format!(
                "command port and http port collide ({})",
                self.command_port
            )));
        }
        if self.initial_storage_entries == 0 {
            return Err(ConfigError::ValidationError(
                "initial_storage_entries must be > 0".to_string(),
            ));
        }
        if self.initial_storage_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "initial_storage_bytes must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// True when periodic snapshots are enabled.
    pub fn snapshots_enabled(&self) -> bool {
        self.snapshot_interval_secs > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn port_collision_rejected() {
        let cfg = ServerConfig {
            http_port: DEFAULT_COMMAND_PORT,
            ..ServerConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn port_collision_ignored_without_http() {
        let cfg = ServerConfig {
            http_port: DEFAULT_COMMAND_PORT,
            enable_http: false,
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_capacity_rejected() {
        let cfg = ServerConfig {
            initial_storage_entries: 0,
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ServerConfig {
            initial_storage_bytes: 0,
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn snapshot_toggle() {
        let mut cfg = ServerConfig::default();
        assert!(cfg.snapshots_enabled());
        cfg.snapshot_interval_secs = 0;
        assert!(!cfg.snapshots_enabled());
    }
}

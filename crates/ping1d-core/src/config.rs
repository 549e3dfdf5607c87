//! Engine configuration
//!
//! Loaded from a JSON file; every field has a default so partial files work.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Errors loading an [`EngineConfig`]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Protocol engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Reply window before a request counts as lost
    pub request_timeout_ms: u64,
    /// Telemetry poll period
    pub poll_interval_ms: u64,
    /// Link baud rate for normal operation
    pub baud_rate: u32,
    /// Apply persisted parameters when a session starts
    pub configure_on_start: bool,
    pub firmware: FirmwareConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_TIMEOUT_MS,
            poll_interval_ms: 1000,
            baud_rate: DEFAULT_BAUD_RATE,
            configure_on_start: true,
            firmware: FirmwareConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Firmware flashing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// Flasher executable, looked up on PATH when not absolute
    pub flasher_program: String,
    /// Baud rate the bootloader listens at
    pub bootloader_baud: u32,
    /// Pause after "goto bootloader" before probing the port
    pub settle_ms: u64,
    /// How long to keep probing for the bootloader port
    pub reconnect_timeout_ms: u64,
    /// Upper bound for the whole flashing process
    pub flash_timeout_secs: u64,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            flasher_program: "stm32flash".to_string(),
            bootloader_baud: 57600,
            settle_ms: 1000,
            reconnect_timeout_ms: 5000,
            flash_timeout_secs: 300,
        }
    }
}

impl FirmwareConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn flash_timeout(&self) -> Duration {
        Duration::from_secs(self.flash_timeout_secs)
    }
}

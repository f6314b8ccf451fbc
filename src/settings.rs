//! Upgrader settings with JSON persistence.
//!
//! This module provides:
//! - `UpgraderSettings` for the link and protocol parameters
//! - Persistence to a JSON file chosen on the command line
//!
//! Every field has a default, so a settings file only needs the values it
//! changes. Command-line flags override what the file says.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::upgrade::{
    SessionConfig, UsbId, ACK_TIMEOUT_MS, CONNECT_TIMEOUT_MS, DEFAULT_BAUD_RATE,
    DEFAULT_TARGET_NODE,
};

/// Link and protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgraderSettings {
    /// Serial baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Reply timeout for bootloader commands, in milliseconds.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Time allowed for the robot to reboot into its bootloader, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Node id of the robot's bootloader.
    #[serde(default = "default_target_node")]
    pub target_node: u16,

    /// Additional VID/PID pairs to treat as a Thymio II.
    #[serde(default)]
    pub extra_usb_ids: Vec<UsbId>,

    /// Compare page checksums after writing, when the bootloader can.
    #[serde(default = "default_verify")]
    pub verify: bool,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_ack_timeout_ms() -> u64 {
    ACK_TIMEOUT_MS
}

fn default_connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT_MS
}

fn default_target_node() -> u16 {
    DEFAULT_TARGET_NODE
}

fn default_verify() -> bool {
    true
}

impl Default for UpgraderSettings {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            ack_timeout_ms: default_ack_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            target_node: default_target_node(),
            extra_usb_ids: Vec::new(),
            verify: default_verify(),
        }
    }
}

impl UpgraderSettings {
    /// Protocol parameters for a bootloader session.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            target_node: self.target_node,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    /// Check if these settings differ from defaults.
    pub fn has_non_default_settings(&self) -> bool {
        *self != Self::default()
    }
}

/// Manages persistence of settings to a JSON file.
pub struct SettingsManager {
    settings_file_path: PathBuf,
}

impl SettingsManager {
    /// Create a settings manager for the given file.
    pub fn new(settings_file_path: &Path) -> Self {
        Self {
            settings_file_path: settings_file_path.to_path_buf(),
        }
    }

    /// Load settings from disk, returning defaults if file doesn't exist.
    pub fn load(&self) -> Result<UpgraderSettings, String> {
        if !self.settings_file_path.exists() {
            return Ok(UpgraderSettings::default());
        }

        let contents = fs::read_to_string(&self.settings_file_path)
            .map_err(|e| format!("Failed to read settings file: {}", e))?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(UpgraderSettings::default());
        }

        serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse settings JSON: {}", e))
    }

    /// Save settings to disk.
    pub fn save(&self, settings: &UpgraderSettings) -> Result<(), String> {
        if let Some(parent) = self.settings_file_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings directory: {}", e))?;
        }

        let contents = serde_json::to_string_pretty(settings)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        fs::write(&self.settings_file_path, contents)
            .map_err(|e| format!("Failed to write settings file: {}", e))?;

        Ok(())
    }

    /// Get the path where settings are stored.
    pub fn settings_path(&self) -> &Path {
        &self.settings_file_path
    }
}

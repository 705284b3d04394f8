//! Driver configuration
//!
//! Mirrors the `[mmu2s]` config section. Stored as JSON; every field except
//! the pins has a default.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{
    port::{DEFAULT_BY_ID_DIR, DEFAULT_BY_PATH_DIR},
    CommandTimeouts, ConnectionConfig, MmuError, PortLocator, DEFAULT_BAUD_RATE,
    DEFAULT_RETRIES, PROBE_TIMEOUT_SECS, RESPONSE_TIMEOUT_SECS,
};

/// Runout reaction used when the config does not supply one
pub const DEFAULT_RUNOUT_GCODE: &str = "M118 Finda Runout Detected\nM117 Finda Runout Detected\n";

/// MMU2S configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mmu2sConfig {
    /// Serial port; absent to autodetect
    #[serde(default)]
    pub serial: Option<String>,

    /// Pin wired to the MMU reset line
    pub reset_pin: String,

    /// Pin of the idler IR sensor
    pub idler_sensor_pin: String,

    /// G-code run on a Finda runout
    #[serde(default = "default_runout_gcode")]
    pub runout_gcode: String,

    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Timeout for commands that move hardware, in seconds
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: f64,

    /// Timeout for Finda reads, in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: f64,

    /// Retries after the first attempt
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// udev identity symlink directory
    #[serde(default = "default_by_id_dir")]
    pub by_id_dir: PathBuf,

    /// udev physical-path symlink directory
    #[serde(default = "default_by_path_dir")]
    pub by_path_dir: PathBuf,

    /// External flashing tool
    #[serde(default = "default_flash_tool")]
    pub flash_tool: String,

    /// MCU part passed to the flashing tool
    #[serde(default = "default_flash_part")]
    pub flash_part: String,

    /// Programmer type passed to the flashing tool
    #[serde(default = "default_flash_programmer")]
    pub flash_programmer: String,
}

fn default_runout_gcode() -> String {
    DEFAULT_RUNOUT_GCODE.to_string()
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_response_timeout() -> f64 {
    RESPONSE_TIMEOUT_SECS
}

fn default_probe_timeout() -> f64 {
    PROBE_TIMEOUT_SECS
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_by_id_dir() -> PathBuf {
    PathBuf::from(DEFAULT_BY_ID_DIR)
}

fn default_by_path_dir() -> PathBuf {
    PathBuf::from(DEFAULT_BY_PATH_DIR)
}

fn default_flash_tool() -> String {
    "avrdude".to_string()
}

fn default_flash_part() -> String {
    "atmega32u4".to_string()
}

fn default_flash_programmer() -> String {
    "avr109".to_string()
}

impl Default for Mmu2sConfig {
    fn default() -> Self {
        Self {
            serial: None,
            reset_pin: String::new(),
            idler_sensor_pin: String::new(),
            runout_gcode: default_runout_gcode(),
            baud_rate: default_baud_rate(),
            response_timeout_secs: default_response_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            retries: default_retries(),
            by_id_dir: default_by_id_dir(),
            by_path_dir: default_by_path_dir(),
            flash_tool: default_flash_tool(),
            flash_part: default_flash_part(),
            flash_programmer: default_flash_programmer(),
        }
    }
}

impl Mmu2sConfig {
    /// Parse from JSON
    pub fn from_json(content: &str) -> Result<Self, MmuError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| MmuError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, MmuError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| MmuError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    /// Reject values the driver cannot work with
    pub fn validate(&self) -> Result<(), MmuError> {
        if self.reset_pin.trim().is_empty() {
            return Err(MmuError::Config("reset_pin must be set".to_string()));
        }
        if self.idler_sensor_pin.trim().is_empty() {
            return Err(MmuError::Config("idler_sensor_pin must be set".to_string()));
        }
        for (name, secs) in [
            ("response_timeout_secs", self.response_timeout_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
        ] {
            if !(secs.is_finite() && secs > 0.0) {
                return Err(MmuError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    /// True when the port is autodetected
    pub fn autodetect(&self) -> bool {
        self.serial.is_none()
    }

    /// Symlink locator for the configured udev directories
    pub fn locator(&self) -> PortLocator {
        PortLocator::new(&self.by_id_dir, &self.by_path_dir)
    }

    /// Connection settings with the standard timing budgets
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            port: self.serial.as_ref().map(PathBuf::from),
            baud_rate: self.baud_rate,
            locator: self.locator(),
            ..Default::default()
        }
    }

    /// Per-class command timeouts
    pub fn timeouts(&self) -> CommandTimeouts {
        CommandTimeouts {
            probe: Duration::from_secs_f64(self.probe_timeout_secs),
            default: Duration::from_secs_f64(self.response_timeout_secs),
        }
    }
}

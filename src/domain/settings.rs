use crate::domain::error::ConfigError;
use crate::domain::models::DeviceIdentity;
use crate::domain::position::DEFAULT_TOLERANCE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "shade_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub devices: Vec<DeviceIdentity>,

    /// Seconds to wait after the host finished restoring before scanning.
    #[serde(default, alias = "discoveryDelay")]
    pub discovery_delay: u64,

    // Polling
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_movement_tolerance")]
    pub movement_tolerance: u8,
    #[serde(default = "default_command_throttle_ms")]
    pub command_throttle_ms: u64,
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            discovery_delay: 0,
            poll_interval_secs: default_poll_interval_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
            movement_tolerance: default_movement_tolerance(),
            command_throttle_ms: default_command_throttle_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
            log_settings: LogSettings::default(),
        }
    }
}

impl Settings {
    pub fn discovery_delay(&self) -> Duration {
        Duration::from_secs(self.discovery_delay)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs.max(1))
    }

    pub fn command_throttle(&self) -> Duration {
        Duration::from_millis(self.command_throttle_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

fn default_poll_interval_secs() -> u64 {
    10
}
fn default_operation_timeout_secs() -> u64 {
    10
}
fn default_movement_tolerance() -> u8 {
    DEFAULT_TOLERANCE
}
fn default_command_throttle_ms() -> u64 {
    1000
}
fn default_stall_timeout_secs() -> u64 {
    120
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Loads from `path`, or from the per-user config directory when `None`.
    /// A missing file yields defaults; an unreadable or malformed one is an error.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let settings_path = match path {
            Some(path) => path,
            None => Self::default_settings_path()?,
        };
        let settings = if settings_path.exists() {
            Self::load_from_file(&settings_path)?
        } else {
            Settings::default()
        };

        Ok(Self {
            settings,
            settings_path,
        })
    }

    pub fn default_settings_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push("shade-bridge");
        path.push("config.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> Result<Settings, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    /// Directory holding the settings file; sibling state files live here.
    pub fn config_dir(&self) -> PathBuf {
        self.settings_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// A configured shade: the name shown to the host and the BLE address it lives at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    #[serde(rename = "id")]
    pub address: String,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Case- and separator-insensitive key used to match advertisements.
    pub fn key(&self) -> String {
        normalize_address(&self.address)
    }

    pub fn matches(&self, address: &str) -> bool {
        self.key() == normalize_address(address)
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for DeviceIdentity {}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Lower-cases a link address and strips `:`/`-` separators.
pub fn normalize_address(address: &str) -> String {
    address
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PositionState {
    Decreasing,
    Increasing,
    #[default]
    Stopped,
}

/// Host-facing shade state. Positions use host convention (100 = fully open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShadeState {
    pub current_position: u8,
    pub target_position: u8,
    pub position_state: PositionState,
    pub movement_in_flight: bool,
}

impl ShadeState {
    /// True when `position_state` and `movement_in_flight` disagree.
    pub fn is_inconsistent(&self) -> bool {
        (self.position_state == PositionState::Stopped) == self.movement_in_flight
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryState {
    pub level: u8,
    pub low: bool,
}

impl BatteryState {
    pub fn from_level(level: u8, threshold: u8) -> Self {
        let level = level.min(100);
        Self {
            level,
            low: level <= threshold,
        }
    }
}

impl Default for BatteryState {
    fn default() -> Self {
        Self {
            level: 100,
            low: false,
        }
    }
}

/// Device-information service contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInformation {
    pub manufacturer: String,
    pub serial_number: String,
    pub hardware_revision: String,
    pub firmware_revision: String,
    pub software_revision: String,
}

impl Default for DeviceInformation {
    fn default() -> Self {
        Self {
            manufacturer: UNKNOWN_FIELD.to_string(),
            serial_number: UNKNOWN_FIELD.to_string(),
            hardware_revision: UNKNOWN_FIELD.to_string(),
            firmware_revision: UNKNOWN_FIELD.to_string(),
            software_revision: UNKNOWN_FIELD.to_string(),
        }
    }
}

/// Placeholder for text fields the device did not report.
pub const UNKNOWN_FIELD: &str = "Unknown";

/// A single value pushed to the accessory host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExposedValue {
    CurrentPosition(u8),
    TargetPosition(u8),
    PositionState(PositionState),
    BatteryLevel(u8),
    StatusLowBattery(bool),
    Information(DeviceInformation),
}

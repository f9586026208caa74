//! Shade Motor Protocol
//!
//! GATT identifiers and byte encodings for the shade motor. The motor speaks
//! three services: the standard device-information and battery services, and
//! a vendor motor service whose characteristics carry single-byte positions
//! in device convention (0 = open, 100 = closed).

use crate::domain::error::DeviceError;
use crate::domain::models::UNKNOWN_FIELD;
use uuid::Uuid;

/// Expands a 16-bit SIG-assigned id onto the Bluetooth base UUID.
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

/// Vendor ids share a base and differ only in the first 32 bits.
const fn vendor_uuid(short: u32) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_b87f_490c_92cb_11ba5ea5167c)
}

// Services
pub const DEVICE_INFO_SERVICE: Uuid = sig_uuid(0x180a);
pub const BATTERY_SERVICE: Uuid = sig_uuid(0x180f);
pub const MOTOR_SERVICE: Uuid = vendor_uuid(0x0000_1861);

// Device information characteristics
pub const MANUFACTURER_NAME: Uuid = sig_uuid(0x2a29);
pub const SERIAL_NUMBER: Uuid = sig_uuid(0x2a25);
pub const HARDWARE_REVISION: Uuid = sig_uuid(0x2a27);
pub const FIRMWARE_REVISION: Uuid = sig_uuid(0x2a26);
pub const SOFTWARE_REVISION: Uuid = sig_uuid(0x2a28);

pub const BATTERY_LEVEL: Uuid = sig_uuid(0x2a19);

// Motor characteristics
/// Current position.
pub const MOTOR_STATE: Uuid = vendor_uuid(0x0000_1525);
pub const MOTOR_TARGET: Uuid = vendor_uuid(0x0000_1526);
pub const MOTOR_CONTROL: Uuid = vendor_uuid(0x0000_1530);

/// Written to [`MOTOR_CONTROL`] to halt the motor.
pub const STOP_COMMAND: u8 = 0x50;

pub const SERVICES: [Uuid; 3] = [DEVICE_INFO_SERVICE, BATTERY_SERVICE, MOTOR_SERVICE];

pub const DEVICE_INFO_CHARACTERISTICS: [Uuid; 5] = [
    MANUFACTURER_NAME,
    SERIAL_NUMBER,
    HARDWARE_REVISION,
    FIRMWARE_REVISION,
    SOFTWARE_REVISION,
];

/// Exact characteristic set each service must expose.
pub fn expected_characteristics(service: Uuid) -> &'static [Uuid] {
    const BATTERY: [Uuid; 1] = [BATTERY_LEVEL];
    const MOTOR: [Uuid; 3] = [MOTOR_STATE, MOTOR_TARGET, MOTOR_CONTROL];

    if service == DEVICE_INFO_SERVICE {
        &DEVICE_INFO_CHARACTERISTICS
    } else if service == BATTERY_SERVICE {
        &BATTERY
    } else if service == MOTOR_SERVICE {
        &MOTOR
    } else {
        &[]
    }
}

/// Checks that `found` is exactly `expected`, ignoring order.
pub fn validate_shape(kind: &str, expected: &[Uuid], found: &[Uuid]) -> Result<(), DeviceError> {
    let all_present = expected.iter().all(|uuid| found.contains(uuid));
    if found.len() != expected.len() || !all_present {
        return Err(DeviceError::ProtocolMismatch(format!(
            "expected {} {kind} {expected:?}, found {} {found:?}",
            expected.len(),
            found.len(),
        )));
    }
    Ok(())
}

/// Decodes a single-byte position or battery value.
pub fn decode_byte(value: &[u8]) -> Result<u8, DeviceError> {
    value
        .first()
        .copied()
        .ok_or_else(|| DeviceError::ProtocolMismatch("empty value".to_string()))
}

/// Decodes a text characteristic; anything unreadable becomes the placeholder.
pub fn decode_text(value: &[u8]) -> String {
    let text = String::from_utf8_lossy(value);
    let text = text.trim_end_matches('\0').trim();
    if text.is_empty() || text.contains(char::REPLACEMENT_CHARACTER) {
        UNKNOWN_FIELD.to_string()
    } else {
        text.to_string()
    }
}

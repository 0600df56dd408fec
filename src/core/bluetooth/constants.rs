//! Constants used throughout the application
//! This module contains the constant values used by the session core,
//! such as well-known UUIDs and default timings.

use uuid::Uuid;

/// Name shown for devices that never advertised one
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";

/// The Bluetooth SIG base UUID; 16-bit UUIDs are expanded into bits 96..112
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Standard Bluetooth Service UUIDs
pub const UUID_GENERIC_ACCESS_SERVICE: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
pub const UUID_GENERIC_ATTRIBUTE_SERVICE: Uuid = Uuid::from_u128(0x00001801_0000_1000_8000_00805f9b34fb);
pub const UUID_DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const UUID_HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
pub const UUID_ENVIRONMENTAL_SENSING_SERVICE: Uuid = Uuid::from_u128(0x0000181a_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_DEVICE_NAME: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);
pub const UUID_APPEARANCE: Uuid = Uuid::from_u128(0x00002a01_0000_1000_8000_00805f9b34fb);
pub const UUID_SERVICE_CHANGED: Uuid = Uuid::from_u128(0x00002a05_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
pub const UUID_MODEL_NUMBER: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);
pub const UUID_SERIAL_NUMBER: Uuid = Uuid::from_u128(0x00002a25_0000_1000_8000_00805f9b34fb);
pub const UUID_FIRMWARE_REVISION: Uuid = Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb);
pub const UUID_MANUFACTURER_NAME: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);
pub const UUID_HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
pub const UUID_BODY_SENSOR_LOCATION: Uuid = Uuid::from_u128(0x00002a38_0000_1000_8000_00805f9b34fb);
pub const UUID_HEART_RATE_CONTROL_POINT: Uuid = Uuid::from_u128(0x00002a39_0000_1000_8000_00805f9b34fb);
pub const UUID_TEMPERATURE: Uuid = Uuid::from_u128(0x00002a6e_0000_1000_8000_00805f9b34fb);
pub const UUID_HUMIDITY: Uuid = Uuid::from_u128(0x00002a6f_0000_1000_8000_00805f9b34fb);

/// Scan duration in milliseconds
pub const DEFAULT_SCAN_DURATION_MS: u64 = 30_000;

/// Timeout for establishing a connection in milliseconds
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 10_000;

/// Interval between two liveness sweeps in milliseconds
pub const DEFAULT_LIVENESS_INTERVAL_MS: u64 = 2_000;

/// Caller-side soft timeout for reads and writes in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;

const KNOWN_UUIDS: &[(Uuid, &str)] = &[
    (UUID_GENERIC_ACCESS_SERVICE, "Generic Access"),
    (UUID_GENERIC_ATTRIBUTE_SERVICE, "Generic Attribute"),
    (UUID_DEVICE_INFORMATION_SERVICE, "Device Information"),
    (UUID_HEART_RATE_SERVICE, "Heart Rate"),
    (UUID_BATTERY_SERVICE, "Battery Service"),
    (UUID_ENVIRONMENTAL_SENSING_SERVICE, "Environmental Sensing"),
    (UUID_DEVICE_NAME, "Device Name"),
    (UUID_APPEARANCE, "Appearance"),
    (UUID_SERVICE_CHANGED, "Service Changed"),
    (UUID_BATTERY_LEVEL, "Battery Level"),
    (UUID_MODEL_NUMBER, "Model Number String"),
    (UUID_SERIAL_NUMBER, "Serial Number String"),
    (UUID_FIRMWARE_REVISION, "Firmware Revision String"),
    (UUID_MANUFACTURER_NAME, "Manufacturer Name String"),
    (UUID_HEART_RATE_MEASUREMENT, "Heart Rate Measurement"),
    (UUID_BODY_SENSOR_LOCATION, "Body Sensor Location"),
    (UUID_HEART_RATE_CONTROL_POINT, "Heart Rate Control Point"),
    (UUID_TEMPERATURE, "Temperature"),
    (UUID_HUMIDITY, "Humidity"),
];

/// Returns the human readable name of a well-known service or characteristic UUID
pub fn describe_uuid(uuid: &Uuid) -> Option<&'static str> {
    KNOWN_UUIDS
        .iter()
        .find(|(known, _)| known == uuid)
        .map(|(_, name)| *name)
}

/// Expands a 16-bit SIG assigned number into a full 128-bit UUID
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Parses a characteristic or service id given either as a full UUID
/// or as a 16-bit short form such as `2a19` or `0x2A19`.
pub fn parse_uuid(text: &str) -> Option<Uuid> {
    let text = text.trim();
    let short = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if short.len() == 4 {
        return u16::from_str_radix(short, 16).ok().map(uuid_from_u16);
    }
    Uuid::parse_str(text).ok()
}

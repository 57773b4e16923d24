//! Constants used throughout the crate
//! This module contains the constant values used when talking to printers,
//! such as service UUIDs, channel numbers and default timeouts.

use uuid::Uuid;

/// Placeholder name for devices that do not report one
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// Serial Port Profile service class UUID (0x1101)
pub const UUID_SERIAL_PORT_PROFILE: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);

/// RFCOMM channel used by the direct-channel fallback
pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

/// Listing scan duration in milliseconds
pub const DEFAULT_LISTING_SCAN_TIMEOUT_MS: u64 = 5_000;

/// Just-in-time lookup scan duration in milliseconds
pub const DEFAULT_LOOKUP_SCAN_TIMEOUT_MS: u64 = 10_000;

/// Timeout for a single stream-socket connect strategy in milliseconds
pub const DEFAULT_STREAM_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Timeout for a GATT connect handshake in milliseconds
pub const DEFAULT_GATT_CONNECT_TIMEOUT_MS: u64 = 15_000;

/// Timeout for service and characteristic enumeration in milliseconds
pub const DEFAULT_ENUMERATION_TIMEOUT_MS: u64 = 10_000;

/// Write length used when a characteristic does not report its own
pub const DEFAULT_BLE_WRITE_LEN: usize = 20;

/// Remediation hint attached to `CONNECTION_FAILED`
pub const CONNECTION_FAILED_HINT: &str = "Please ensure:\n\
    1. The printer is powered on\n\
    2. The printer is paired with your device\n\
    3. You have the correct Bluetooth address";

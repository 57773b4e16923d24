//! Defines shared data structures for the Bluetooth module.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::constants::UNKNOWN_DEVICE_NAME;

/// Represents a printer known to the device directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable identifier (MAC address or platform-assigned UUID)
    pub identifier: String,
    /// The name of the device, if available
    pub name: Option<String>,
    /// Whether the device is paired/bonded with this host
    pub paired: bool,
}

impl DeviceDescriptor {
    /// Creates a new DeviceDescriptor instance
    pub fn new(identifier: impl Into<String>, name: Option<String>, paired: bool) -> Self {
        Self {
            identifier: identifier.into(),
            name,
            paired,
        }
    }

    /// Name to show for the device, falling back to a placeholder
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)
    }
}

/// A `{name, address}` entry as returned by `getBondedDevices`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BondedDevice {
    pub name: String,
    pub address: String,
}

impl From<DeviceDescriptor> for BondedDevice {
    fn from(device: DeviceDescriptor) -> Self {
        Self {
            name: device.display_name().to_string(),
            address: device.identifier,
        }
    }
}

/// Tri-state adapter capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    /// No Bluetooth hardware, or it cannot be reached
    Unavailable,
    /// Hardware present but the radio is off
    PoweredOff,
    /// Hardware present and powered on
    Ready,
}

impl Capability {
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "unavailable"),
            Self::PoweredOff => write!(f, "powered off"),
            Self::Ready => write!(f, "powered on"),
        }
    }
}

/// How a backend discovers and connects to devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceModel {
    /// Bonded devices addressed by MAC, stream sockets (Bluetooth Classic)
    AddressBook,
    /// Advertisement scan, GATT connect, service enumeration (BLE)
    Broadcast,
}

impl DeviceModel {
    /// Whether a writable characteristic must be located after connecting
    pub fn requires_enumeration(self) -> bool {
        self == Self::Broadcast
    }
}

/// State of the connection session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Resolving,
    Connecting,
    Enumerating,
    Open,
    Closing,
    Failed,
}

/// Unsolicited notifications delivered to the caller side
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "method", content = "arguments")]
pub enum PrinterEvent {
    /// An open channel was lost without `disconnect()` being called
    #[serde(rename = "onDisconnected")]
    Disconnected { address: String },
    /// The adapter became ready after being unavailable
    #[serde(rename = "onBluetoothStateChanged")]
    BluetoothStateChanged { state: String },
    /// The session moved to a new state
    #[serde(rename = "onStateChanged")]
    StateChanged { state: SessionState },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bonded_device_uses_placeholder_name() {
        let device = DeviceDescriptor::new("AA:BB:CC:DD:EE:FF", None, true);
        let bonded = BondedDevice::from(device);
        assert_eq!(bonded.name, "Unknown Device");
        assert_eq!(bonded.address, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_event_serialization() {
        let event = PrinterEvent::BluetoothStateChanged {
            state: "on".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"method": "onBluetoothStateChanged", "arguments": {"state": "on"}})
        );
    }
}

//! Error taxonomy for printer connections.
//!
//! Every variant carries the stable wire code the embedding application
//! matches on (see [`PrinterError::code`]).

use thiserror::Error;

use crate::core::bluetooth::types::Capability;

/// Errors surfaced to callers of the printer manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrinterError {
    #[error("Bluetooth is not available or turned on ({0})")]
    BluetoothUnavailable(Capability),

    #[error("Bluetooth permission not granted: {0}")]
    PermissionDenied(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("Invalid Bluetooth address format: {0}")]
    InvalidAddress(String),

    #[error("Could not find device with address {0}")]
    DeviceNotFound(String),

    #[error("Device {0} is not paired with this device")]
    DeviceNotPaired(String),

    #[error("{0}")]
    ConnectionTimeout(String),

    #[error("Failed to connect to the printer: {reason}\n{hint}")]
    ConnectionFailed { reason: String, hint: String },

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("No Bluetooth services found on the device. This may not be a compatible printer.")]
    NoServicesFound,

    #[error("No writable characteristic found on the device")]
    NoWritableCharacteristic,

    #[error("Connection attempt was cancelled")]
    Cancelled,

    #[error("Failed to disconnect: {0}")]
    DisconnectFailed(String),

    #[error("No printer connected")]
    NotConnected,

    #[error("Failed to write to the printer: {0}")]
    WriteFailed(String),

    #[error("Failed to scan for devices: {0}")]
    ScanFailed(String),

    #[error("Method not implemented: {0}")]
    NotImplemented(String),
}

impl PrinterError {
    /// Stable error code reported to the caller side
    pub fn code(&self) -> &'static str {
        match self {
            Self::BluetoothUnavailable(_) => "BLUETOOTH_UNAVAILABLE",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::DeviceNotPaired(_) => "DEVICE_NOT_PAIRED",
            Self::ConnectionTimeout(_) => "CONNECTION_TIMEOUT",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::ServiceDiscoveryFailed(_) => "SERVICE_DISCOVERY_FAILED",
            Self::NoServicesFound => "NO_SERVICES_FOUND",
            Self::NoWritableCharacteristic => "NO_WRITABLE_CHARACTERISTIC",
            Self::Cancelled => "CONNECTION_CANCELLED",
            Self::DisconnectFailed(_) => "DISCONNECT_FAILED",
            Self::NotConnected => "NOT_CONNECTED",
            Self::WriteFailed(_) => "WRITE_FAILED",
            Self::ScanFailed(_) => "SCAN_FAILED",
            Self::NotImplemented(_) => "NOT_IMPLEMENTED",
        }
    }
}

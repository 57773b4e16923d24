//! Platform backends.
//!
//! A backend is the per-device-model strategy the connection session drives:
//! it resolves identifiers, establishes a transport with one of its connect
//! strategies, and hands back a [`Link`] that binds the writable channel.

pub mod ble;
pub mod mock;
#[cfg(target_os = "linux")]
pub mod rfcomm;

use std::fmt;
use std::sync::OnceLock;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use regex::Regex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::bluetooth::error::PrinterError;
use crate::core::bluetooth::types::{Capability, DeviceDescriptor, DeviceModel};

/// One way of opening a transport to a device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectStrategy {
    /// RFCOMM socket located through the service record for `uuid`
    ServiceRecord(Uuid),
    /// RFCOMM socket on a fixed channel, skipping service discovery.
    /// Not every platform can open one; backends without the primitive
    /// leave it out of their strategy list.
    DirectChannel(u8),
    /// GATT connection
    Gatt,
}

impl fmt::Display for ConnectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceRecord(uuid) => write!(f, "service record {}", uuid),
            Self::DirectChannel(channel) => write!(f, "direct channel {}", channel),
            Self::Gatt => write!(f, "GATT"),
        }
    }
}

/// Hardware notifications published by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// The adapter's capability changed (radio toggled, adapter removed)
    CapabilityChanged(Capability),
    /// The transport to `identifier` went away
    DeviceDisconnected(String),
}

/// Transport-level connection to a printer
#[async_trait]
pub trait Link: Send {
    /// Locates the writable sink. No-op for stream sockets.
    async fn bind_channel(&mut self) -> Result<(), PrinterError>;

    /// Sends bytes over the bound sink
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Closes the transport. May be called more than once.
    async fn close(&mut self) -> Result<()>;

    /// Whether the transport is still usable
    fn is_live(&self) -> bool;
}

/// Platform strategy behind the connection session
#[async_trait]
pub trait BluetoothBackend: Send + Sync + 'static {
    /// Device model this backend speaks
    fn model(&self) -> DeviceModel;

    /// Human readable `"<OS> <release>"`
    fn platform_version(&self) -> String {
        platform_version()
    }

    /// Current adapter capability, queried fresh on every call
    async fn capability(&self) -> Capability;

    /// Checks the host permission needed to use the adapter
    async fn check_permission(&self) -> Result<(), PrinterError> {
        Ok(())
    }

    /// Enumerates bonded devices (address-book model)
    async fn bonded_devices(&self) -> Result<Vec<DeviceDescriptor>, PrinterError>;

    /// Starts a hardware scan. Dropping the stream stops it.
    async fn scan(&self) -> Result<BoxStream<'static, DeviceDescriptor>, PrinterError>;

    /// Rejects identifiers the platform cannot address
    fn validate_identifier(&self, _identifier: &str) -> Result<(), PrinterError> {
        Ok(())
    }

    /// Looks up a device the directory does not know
    async fn resolve(&self, identifier: &str) -> Result<Option<DeviceDescriptor>, PrinterError>;

    /// Ordered connect strategies, primary first
    fn connect_strategies(&self) -> Vec<ConnectStrategy>;

    /// Opens a transport using `strategy`
    async fn establish(
        &self,
        device: &DeviceDescriptor,
        strategy: &ConnectStrategy,
    ) -> Result<Box<dyn Link>>;

    /// Subscribes to hardware notifications
    fn events(&self) -> broadcast::Receiver<BackendEvent>;
}

/// Checks for a colon separated MAC address, e.g. `AA:BB:CC:DD:EE:FF`
pub fn is_valid_mac_address(address: &str) -> bool {
    static MAC_ADDRESS: OnceLock<Regex> = OnceLock::new();
    MAC_ADDRESS
        .get_or_init(|| {
            Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("valid MAC address pattern")
        })
        .is_match(address)
}

/// OS name and release of the host
pub fn platform_version() -> String {
    let os = match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "macOS",
        "windows" => "Windows",
        "android" => "Android",
        "ios" => "iOS",
        other => other,
    };

    if cfg!(target_os = "linux") {
        if let Ok(release) = std::fs::read_to_string("/proc/sys/kernel/osrelease") {
            return format!("{} {}", os, release.trim());
        }
    }

    os.to_string()
}

//! Bluetooth printer connectivity
//! This module handles discovery, connection and the byte channel to a
//! receipt printer over Bluetooth Classic or Bluetooth LE.

pub mod backend;
mod channel;
mod connection;
mod constants;
mod directory;
mod error;
mod manager;
mod pending;
mod scanner;
mod session;
mod types;

// Re-export types that should be publicly accessible
pub use backend::{BackendEvent, BluetoothBackend, ConnectStrategy, Link};
pub use channel::ChannelHandle;
pub use connection::ConnectionManager;
pub use constants::*; // Re-export all constants
pub use directory::DeviceDirectory;
pub use error::PrinterError;
pub use manager::PrinterManager;
pub use pending::PendingResult;
pub use scanner::BluetoothScanner;
pub use types::{
    BondedDevice, Capability, DeviceDescriptor, DeviceModel, PrinterEvent, SessionState,
};

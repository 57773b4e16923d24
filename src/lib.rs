//! Thermal printer link library
//! Discovers Bluetooth receipt printers, keeps a single connection open and
//! exposes the method-call surface used by host applications.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;

pub use commands::{MethodCall, MethodError, handle_method_call};
pub use config::PrinterConfig;
pub use crate::core::bluetooth::{
    BondedDevice, Capability, DeviceDescriptor, DeviceModel, PrinterError, PrinterEvent,
    PrinterManager, SessionState,
};
pub use state::{AppState, BackendKind};

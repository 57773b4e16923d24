//! Core functionality for the printer link
//! This module contains the Bluetooth stack used to reach receipt printers.

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{PrinterError, PrinterManager};

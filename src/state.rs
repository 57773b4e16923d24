//! Application state management
//! This module builds the printer manager on top of the platform backend.

use std::sync::Arc;

use anyhow::Result;
use log::info;

use crate::config::PrinterConfig;
use crate::core::PrinterManager;
use crate::core::bluetooth::BluetoothBackend;
use crate::core::bluetooth::backend::ble::BleBackend;
use crate::core::bluetooth::backend::mock::MockBackend;

/// Which backend the host talks through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// RFCOMM on Linux, Bluetooth LE elsewhere
    #[default]
    Platform,
    /// Bluetooth LE through the default adapter
    Ble,
    /// In-memory backend for demos
    Mock,
}

/// Global application state
pub struct AppState {
    /// The printer manager instance
    pub printer_manager: Arc<PrinterManager>,
    pub config: PrinterConfig,
}

impl AppState {
    /// Creates a new AppState instance
    pub async fn new(config: PrinterConfig, kind: BackendKind) -> Result<Self> {
        info!("Initializing PrinterManager with {:?} backend...", kind);
        let backend = Self::backend(&config, kind).await?;
        let manager = PrinterManager::new(backend, config.clone());
        Ok(Self {
            printer_manager: Arc::new(manager),
            config,
        })
    }

    async fn backend(config: &PrinterConfig, kind: BackendKind) -> Result<Arc<dyn BluetoothBackend>> {
        let backend: Arc<dyn BluetoothBackend> = match kind {
            BackendKind::Mock => Arc::new(MockBackend::address_book()),
            BackendKind::Ble => Arc::new(BleBackend::new().await),
            #[cfg(target_os = "linux")]
            BackendKind::Platform => Arc::new(
                crate::core::bluetooth::backend::rfcomm::RfcommBackend::new(config.clone()).await?,
            ),
            #[cfg(not(target_os = "linux"))]
            BackendKind::Platform => {
                let _ = config;
                Arc::new(BleBackend::new().await)
            }
        };
        Ok(backend)
    }

    /// Gets a reference to the printer manager
    pub fn get_printer_manager_arc(&self) -> Arc<PrinterManager> {
        self.printer_manager.clone()
    }

    /// Releases the connection before the host exits
    pub async fn shutdown(&self) {
        self.printer_manager.shutdown().await;
    }
}

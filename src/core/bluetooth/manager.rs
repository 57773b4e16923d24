//! Printer manager
//! This module provides the main interface for printer operations

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{error, info};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::PrinterConfig;
use crate::core::bluetooth::backend::BluetoothBackend;
use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::directory::DeviceDirectory;
use crate::core::bluetooth::error::PrinterError;
use crate::core::bluetooth::pending::PendingResult;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::session::{Command, SessionContext, SessionWorker};
use crate::core::bluetooth::types::{
    BondedDevice, Capability, DeviceDescriptor, DeviceModel, PrinterEvent, SessionState,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Manages printer discovery and the single printer connection.
///
/// Cloning is not supported; share it behind an `Arc`. Must be created
/// inside a tokio runtime.
pub struct PrinterManager {
    backend: Arc<dyn BluetoothBackend>,
    config: PrinterConfig,
    /// Devices seen by the latest listing
    directory: DeviceDirectory,
    scanner: Arc<BluetoothScanner>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<PrinterEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PrinterManager {
    /// Creates a new PrinterManager and starts its session worker
    pub fn new(backend: Arc<dyn BluetoothBackend>, config: PrinterConfig) -> Self {
        let directory = DeviceDirectory::new();
        let scanner = Arc::new(BluetoothScanner::new(backend.clone(), directory.clone()));
        let connector = ConnectionManager::new(backend.clone(), config.clone());

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state) = watch::channel(SessionState::Idle);
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let context = SessionContext {
            backend: backend.clone(),
            directory: directory.clone(),
            scanner: scanner.clone(),
            connector,
            config: config.clone(),
        };
        let worker = SessionWorker::new(context, events.clone(), state_tx);
        let handle = tokio::spawn(worker.run(commands_rx));

        info!("Printer manager started ({:?} backend)", backend.model());

        Self {
            backend,
            config,
            directory,
            scanner,
            commands,
            state,
            events,
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn config(&self) -> &PrinterConfig {
        &self.config
    }

    pub fn model(&self) -> DeviceModel {
        self.backend.model()
    }

    /// `"<OS> <release>"` of the host
    pub fn platform_version(&self) -> String {
        self.backend.platform_version()
    }

    /// Adapter capability, queried fresh
    pub async fn capability(&self) -> Capability {
        self.backend.capability().await
    }

    /// Lists printers available for connection.
    ///
    /// Address-book backends return a snapshot of the bonded set. Broadcast
    /// backends run a listing scan for the configured duration.
    pub async fn bonded_devices(&self) -> Result<Vec<BondedDevice>, PrinterError> {
        let devices = self.scan(self.config.listing_scan_timeout()).await?;
        Ok(devices.into_iter().map(BondedDevice::from).collect())
    }

    /// Lists devices, scanning for at most `timeout` on broadcast backends
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>, PrinterError> {
        self.scanner.scan(timeout).await
    }

    /// Ends a running scan early. Returns `false` if none was running.
    pub async fn stop_scan(&self) -> bool {
        self.scanner.stop_scan().await
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Connects to the printer at `address`, replacing any current session.
    ///
    /// Resolves to `Ok(true)` once the channel is writable. If the attempt is
    /// superseded by another `connect` or by `disconnect`, resolves to
    /// [`PrinterError::Cancelled`].
    pub async fn connect(&self, address: Option<&str>) -> Result<bool, PrinterError> {
        let identifier = match address {
            Some(address) if !address.trim().is_empty() => address.to_string(),
            _ => {
                return Err(PrinterError::InvalidArgument(
                    "Bluetooth address is required".to_string(),
                ));
            }
        };

        let capability = self.backend.capability().await;
        if !capability.is_ready() {
            return Err(PrinterError::BluetoothUnavailable(capability));
        }
        self.backend.check_permission().await?;
        self.backend.validate_identifier(&identifier)?;

        let (reply, result) = PendingResult::channel();
        self.commands
            .send(Command::Connect { identifier, reply })
            .map_err(|_| PrinterError::Cancelled)?;

        // A released slot means the attempt was superseded.
        result.await.unwrap_or(Err(PrinterError::Cancelled))
    }

    /// Tears down the current session. Returns `true` if one existed.
    pub async fn disconnect(&self) -> bool {
        let (reply, result) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).is_err() {
            return false;
        }
        result.await.unwrap_or(false)
    }

    /// Whether the channel is open and live
    pub async fn is_connected(&self) -> bool {
        let (reply, result) = oneshot::channel();
        if self.commands.send(Command::IsConnected { reply }).is_err() {
            return false;
        }
        result.await.unwrap_or(false)
    }

    /// Sends raw bytes to the connected printer
    pub async fn write(&self, bytes: &[u8]) -> Result<(), PrinterError> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Write {
                bytes: bytes.to_vec(),
                reply,
            })
            .map_err(|_| PrinterError::NotConnected)?;
        result.await.unwrap_or(Err(PrinterError::NotConnected))
    }

    /// Subscribes to unsolicited printer events
    pub fn subscribe(&self) -> broadcast::Receiver<PrinterEvent> {
        self.events.subscribe()
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watches session state transitions
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn directory(&self) -> &DeviceDirectory {
        &self.directory
    }

    /// Stops scans, closes the session and waits for the worker to exit
    pub async fn shutdown(&self) {
        info!("Shutting down printer manager");
        self.scanner.stop_scan().await;

        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Session worker ended with a join error: {:?}", e);
            }
        }
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, error, info};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::backend::BluetoothBackend;
use crate::core::bluetooth::directory::DeviceDirectory;
use crate::core::bluetooth::error::PrinterError;
use crate::core::bluetooth::pending::PendingResult;
use crate::core::bluetooth::types::{DeviceDescriptor, DeviceModel};

type ScanOutcome = Result<Vec<DeviceDescriptor>, PrinterError>;

struct ActiveScan {
    id: u64,
    cancel: CancellationToken,
    result: Arc<PendingResult<ScanOutcome>>,
    handle: JoinHandle<()>,
}

/// Drives time-boxed discovery and fills the device directory.
///
/// At most one hardware scan runs at a time: starting a scan stops the
/// previous one first.
pub struct BluetoothScanner {
    backend: Arc<dyn BluetoothBackend>,
    directory: DeviceDirectory,
    active: Mutex<Option<ActiveScan>>,
    next_scan_id: AtomicU64,
}

impl BluetoothScanner {
    pub fn new(backend: Arc<dyn BluetoothBackend>, directory: DeviceDirectory) -> Self {
        Self {
            backend,
            directory,
            active: Mutex::new(None),
            next_scan_id: AtomicU64::new(1),
        }
    }

    /// Lists devices: the bonded set for address-book backends, or every
    /// device advertising within `timeout` for broadcast backends.
    pub async fn scan(&self, timeout: Duration) -> ScanOutcome {
        let capability = self.backend.capability().await;
        if !capability.is_ready() {
            return Err(PrinterError::BluetoothUnavailable(capability));
        }
        self.backend.check_permission().await?;

        match self.backend.model() {
            DeviceModel::AddressBook => {
                let devices = self.backend.bonded_devices().await?;
                self.directory.replace_all(devices.iter().cloned());
                info!("Found {} bonded device(s)", devices.len());
                Ok(devices)
            }
            DeviceModel::Broadcast => {
                self.stop_scan().await;
                self.directory.clear();
                let (id, rx, cancel) = self.start(timeout, None).await?;
                self.wait(id, rx, cancel).await
            }
        }
    }

    /// Scans until `identifier` shows up or `timeout` expires.
    ///
    /// If another caller stops this scan early, the lookup keeps watching
    /// the directory until its own deadline, since a replacing scan keeps
    /// filling it.
    pub async fn find(
        &self,
        identifier: &str,
        timeout: Duration,
    ) -> Result<Option<DeviceDescriptor>, PrinterError> {
        info!("Scanning for device {} ({:?})", identifier, timeout);
        let deadline = Instant::now() + timeout;
        let mut inserted = self.directory.subscribe();

        self.stop_scan().await;
        let (id, rx, cancel) = self.start(timeout, Some(identifier.to_string())).await?;
        let devices = self.wait(id, rx, cancel).await?;
        if let Some(device) = devices.into_iter().find(|d| d.identifier == identifier) {
            return Ok(Some(device));
        }

        if Instant::now() < deadline {
            debug!("Lookup scan for {} was stopped early, watching directory", identifier);
        }
        loop {
            if let Some(device) = self.directory.get(identifier) {
                return Ok(Some(device));
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(self.directory.get(identifier)),
                changed = inserted.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Stops the running scan, if any. Its caller still receives the
    /// devices seen so far.
    pub async fn stop_scan(&self) -> bool {
        let Some(active) = self.take_active() else {
            return false;
        };
        info!("Stopping Bluetooth scan.");
        active.cancel.cancel();
        Self::join(active.handle).await;
        true
    }

    /// Fails the running scan with `error` and stops it
    pub async fn abort(&self, error: PrinterError) {
        let Some(active) = self.take_active() else {
            return;
        };
        info!("Aborting Bluetooth scan: {}", error);
        active.result.complete(Err(error));
        active.cancel.cancel();
        Self::join(active.handle).await;
    }

    pub fn is_scanning(&self) -> bool {
        self.lock_active()
            .as_ref()
            .is_some_and(|active| !active.handle.is_finished())
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveScan>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_active(&self) -> Option<ActiveScan> {
        self.lock_active().take()
    }

    async fn join(handle: JoinHandle<()>) {
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                error!("Scan task finished with an unexpected join error: {:?}", e);
            }
        }
    }

    async fn start(
        &self,
        timeout: Duration,
        target: Option<String>,
    ) -> Result<(u64, oneshot::Receiver<ScanOutcome>, CancellationToken), PrinterError> {
        let stream = self.backend.scan().await?;

        let id = self.next_scan_id.fetch_add(1, Ordering::Relaxed);
        let (pending, rx) = PendingResult::channel();
        let result = Arc::new(pending);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(Self::internal_scan_task(
            stream,
            self.directory.clone(),
            timeout,
            target,
            cancel.clone(),
            result.clone(),
        ));

        let previous = self.lock_active().replace(ActiveScan {
            id,
            cancel: cancel.clone(),
            result,
            handle,
        });
        // A concurrent caller may have started a scan after our stop_scan().
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        info!("Device scan task started.");
        Ok((id, rx, cancel))
    }

    async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<ScanOutcome>,
        cancel: CancellationToken,
    ) -> ScanOutcome {
        // Dropping the caller's future stops the hardware scan.
        let _guard = cancel.drop_guard();
        let outcome = rx
            .await
            .unwrap_or_else(|_| Err(PrinterError::ScanFailed("scan task ended".to_string())));

        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|a| a.id == id) {
            active.take();
        }
        outcome
    }

    async fn internal_scan_task(
        mut stream: BoxStream<'static, DeviceDescriptor>,
        directory: DeviceDirectory,
        timeout: Duration,
        target: Option<String>,
        cancel: CancellationToken,
        result: Arc<PendingResult<ScanOutcome>>,
    ) {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut seen: HashMap<String, DeviceDescriptor> = HashMap::new();
        let mut stream_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Scan cancelled");
                    break;
                }
                _ = &mut deadline => {
                    debug!("Scan timeout reached");
                    break;
                }
                next = stream.next(), if stream_open => match next {
                    Some(device) => {
                        debug!("Found device - {:?}", device);
                        let is_target = target.as_deref() == Some(device.identifier.as_str());
                        directory.insert(device.clone());
                        seen.insert(device.identifier.clone(), device);
                        if is_target {
                            info!("Found requested device, ending scan early");
                            break;
                        }
                    }
                    None => {
                        info!("Bluetooth scan stream has ended.");
                        stream_open = false;
                    }
                }
            }
        }

        // Stops the hardware scan.
        drop(stream);

        let devices: Vec<DeviceDescriptor> = seen.into_values().collect();
        info!("Scan complete, {} device(s) found", devices.len());
        result.complete(Ok(devices));
    }
}

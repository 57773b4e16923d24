//! Bluetooth LE backend built on bluest.
//!
//! Printers are found by advertisement scan, connected over GATT, and
//! written through the first characteristic that accepts writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bluest::{Adapter, AdapterEvent, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::bluetooth::backend::{BackendEvent, BluetoothBackend, ConnectStrategy, Link};
use crate::core::bluetooth::constants::DEFAULT_BLE_WRITE_LEN;
use crate::core::bluetooth::error::PrinterError;
use crate::core::bluetooth::types::{Capability, DeviceDescriptor, DeviceModel};

/// Broadcast-model backend over the default BLE adapter
pub struct BleBackend {
    adapter: Option<Adapter>,
    /// Devices seen by scans, by identifier
    devices: Arc<Mutex<HashMap<String, Device>>>,
    events: broadcast::Sender<BackendEvent>,
}

impl BleBackend {
    /// Opens the default adapter. A host without one still gets a backend
    /// that reports [`Capability::Unavailable`].
    pub async fn new() -> Self {
        let adapter = Adapter::default().await;
        let (events, _) = broadcast::channel(32);

        match &adapter {
            Some(adapter) => {
                info!("Bluetooth LE adapter found.");
                Self::spawn_adapter_monitor(adapter.clone(), events.clone());
            }
            None => warn!("No Bluetooth LE adapter found"),
        }

        Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    fn spawn_adapter_monitor(adapter: Adapter, events: broadcast::Sender<BackendEvent>) {
        tokio::spawn(async move {
            let stream = match adapter.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to watch adapter state: {}", e);
                    return;
                }
            };
            tokio::pin!(stream);

            while let Some(event) = stream.next().await {
                let capability = match event {
                    Ok(AdapterEvent::Available) => Capability::Ready,
                    Ok(_) => Capability::PoweredOff,
                    Err(e) => {
                        warn!("Adapter event error: {}", e);
                        continue;
                    }
                };
                info!("Bluetooth LE adapter is now {}", capability);
                let _ = events.send(BackendEvent::CapabilityChanged(capability));
            }
        });
    }

    fn adapter(&self) -> Result<&Adapter, PrinterError> {
        self.adapter
            .as_ref()
            .ok_or(PrinterError::BluetoothUnavailable(Capability::Unavailable))
    }

    fn cached_device(&self, identifier: &str) -> Option<Device> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identifier)
            .cloned()
    }

    async fn describe(device: &Device) -> DeviceDescriptor {
        DeviceDescriptor::new(
            device.id().to_string(),
            device.name().ok(),
            device.is_paired().await.unwrap_or(false),
        )
    }
}

#[async_trait]
impl BluetoothBackend for BleBackend {
    fn model(&self) -> DeviceModel {
        DeviceModel::Broadcast
    }

    async fn capability(&self) -> Capability {
        let Some(adapter) = &self.adapter else {
            return Capability::Unavailable;
        };
        match adapter.is_available().await {
            Ok(true) => Capability::Ready,
            Ok(false) => Capability::PoweredOff,
            Err(e) => {
                warn!("Failed to query adapter state: {}", e);
                Capability::Unavailable
            }
        }
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceDescriptor>, PrinterError> {
        let devices: Vec<Device> = self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut bonded = Vec::new();
        for device in devices {
            let descriptor = Self::describe(&device).await;
            if descriptor.paired {
                bonded.push(descriptor);
            }
        }
        Ok(bonded)
    }

    async fn scan(&self) -> Result<BoxStream<'static, DeviceDescriptor>, PrinterError> {
        let adapter = self.adapter()?.clone();
        let devices = self.devices.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let (started_tx, started_rx) = oneshot::channel();

        // The hardware scan lives as long as the receiving stream.
        tokio::spawn(async move {
            let scan_stream = match adapter.scan(&[]).await {
                Ok(stream) => {
                    let _ = started_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = started_tx.send(Err(e.to_string()));
                    return;
                }
            };
            tokio::pin!(scan_stream);
            info!("Bluetooth LE scan started");

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = scan_stream.next() => {
                        let Some(discovered) = next else {
                            info!("Bluetooth LE scan stream has ended.");
                            break;
                        };
                        let device = discovered.device;
                        let identifier = device.id().to_string();
                        let name = discovered
                            .adv_data
                            .local_name
                            .clone()
                            .or_else(|| device.name().ok());
                        let paired = device.is_paired().await.unwrap_or(false);

                        devices
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(identifier.clone(), device);
                        if tx.send(DeviceDescriptor::new(identifier, name, paired)).is_err() {
                            break;
                        }
                    }
                }
            }
            info!("Bluetooth LE scan stopped");
        });

        match started_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(PrinterError::ScanFailed(e)),
            Err(_) => return Err(PrinterError::ScanFailed("scan task ended".to_string())),
        }

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|device| (device, rx))
        })
        .boxed())
    }

    async fn resolve(&self, identifier: &str) -> Result<Option<DeviceDescriptor>, PrinterError> {
        match self.cached_device(identifier) {
            Some(device) => Ok(Some(Self::describe(&device).await)),
            None => Ok(None),
        }
    }

    fn connect_strategies(&self) -> Vec<ConnectStrategy> {
        vec![ConnectStrategy::Gatt]
    }

    async fn establish(
        &self,
        device: &DeviceDescriptor,
        _strategy: &ConnectStrategy,
    ) -> Result<Box<dyn Link>> {
        let adapter = self.adapter()?.clone();
        let peripheral = self
            .cached_device(&device.identifier)
            .ok_or_else(|| anyhow!("device {} has not been discovered", device.identifier))?;

        if !peripheral.is_connected().await {
            adapter.connect_device(&peripheral).await?;
        }
        info!("GATT connection to {} established", device.identifier);

        let live = Arc::new(AtomicBool::new(true));
        let monitor = Self::spawn_connection_monitor(
            adapter.clone(),
            peripheral.clone(),
            device.identifier.clone(),
            live.clone(),
            self.events.clone(),
        );

        Ok(Box::new(BleLink {
            adapter,
            device: peripheral,
            characteristic: None,
            without_response: false,
            live,
            monitor,
            closed: false,
        }))
    }

    fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}

impl BleBackend {
    fn spawn_connection_monitor(
        adapter: Adapter,
        device: Device,
        identifier: String,
        live: Arc<AtomicBool>,
        events: broadcast::Sender<BackendEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let stream = match adapter.device_connection_events(&device).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Cannot watch connection to {}: {}", identifier, e);
                    return;
                }
            };
            tokio::pin!(stream);

            while let Some(event) = stream.next().await {
                if matches!(event, ConnectionEvent::Disconnected) {
                    if live.swap(false, Ordering::SeqCst) {
                        info!("Device {} disconnected", identifier);
                        let _ = events.send(BackendEvent::DeviceDisconnected(identifier));
                    }
                    break;
                }
            }
        })
    }
}

/// GATT connection to one printer
pub struct BleLink {
    adapter: Adapter,
    device: Device,
    characteristic: Option<Characteristic>,
    without_response: bool,
    live: Arc<AtomicBool>,
    monitor: JoinHandle<()>,
    closed: bool,
}

#[async_trait]
impl Link for BleLink {
    async fn bind_channel(&mut self) -> Result<(), PrinterError> {
        let services = self
            .device
            .discover_services()
            .await
            .map_err(|e| PrinterError::ServiceDiscoveryFailed(e.to_string()))?;
        if services.is_empty() {
            return Err(PrinterError::NoServicesFound);
        }

        for service in &services {
            debug!("Available service: {}", service.uuid());
            let characteristics = match service.discover_characteristics().await {
                Ok(characteristics) => characteristics,
                Err(e) => {
                    warn!("Characteristic discovery on {} failed: {}", service.uuid(), e);
                    continue;
                }
            };

            for characteristic in characteristics {
                let Ok(properties) = characteristic.properties().await else {
                    continue;
                };
                if properties.write || properties.write_without_response {
                    info!(
                        "Found writable characteristic {} in service {}",
                        characteristic.uuid(),
                        service.uuid()
                    );
                    self.without_response = !properties.write;
                    self.characteristic = Some(characteristic);
                    return Ok(());
                }
            }
        }

        Err(PrinterError::NoWritableCharacteristic)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let characteristic = self
            .characteristic
            .as_ref()
            .ok_or_else(|| anyhow!("no writable characteristic bound"))?;
        let chunk_len = characteristic
            .max_write_len()
            .unwrap_or(DEFAULT_BLE_WRITE_LEN)
            .max(1);

        for chunk in bytes.chunks(chunk_len) {
            if self.without_response {
                characteristic.write_without_response(chunk).await?;
            } else {
                characteristic.write(chunk).await?;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Our own disconnect must not surface as an unsolicited one.
        self.live.store(false, Ordering::SeqCst);
        self.monitor.abort();
        self.characteristic = None;
        self.adapter.disconnect_device(&self.device).await?;
        Ok(())
    }

    fn is_live(&self) -> bool {
        !self.closed && self.live.load(Ordering::SeqCst)
    }
}

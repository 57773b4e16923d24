//! Bluetooth Classic backend built on bluer (BlueZ).
//!
//! Printers are bonded devices addressed by MAC. Connecting opens an RFCOMM
//! stream socket, first through the SPP service record and then, if
//! fallbacks are enabled, through an alternate record and a fixed channel.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use bluer::rfcomm::stream::OwnedWriteHalf;
use bluer::rfcomm::{Profile, ProfileHandle, Role, SocketAddr, Stream};
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, ErrorKind, Session};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::PrinterConfig;
use crate::core::bluetooth::backend::{
    BackendEvent, BluetoothBackend, ConnectStrategy, Link, is_valid_mac_address,
};
use crate::core::bluetooth::constants::UUID_SERIAL_PORT_PROFILE;
use crate::core::bluetooth::error::PrinterError;
use crate::core::bluetooth::types::{Capability, DeviceDescriptor, DeviceModel};

/// Address-book backend over the default BlueZ adapter
pub struct RfcommBackend {
    session: Session,
    adapter: Option<Adapter>,
    config: PrinterConfig,
    events: broadcast::Sender<BackendEvent>,
}

impl RfcommBackend {
    /// Connects to bluetoothd. Fails only if the daemon cannot be reached;
    /// a missing adapter is reported through [`Capability::Unavailable`].
    pub async fn new(config: PrinterConfig) -> Result<Self> {
        let session = Session::new().await?;
        let adapter = match session.default_adapter().await {
            Ok(adapter) => {
                info!("Using Bluetooth adapter {}", adapter.name());
                Some(adapter)
            }
            Err(e) => {
                warn!("No Bluetooth adapter found: {}", e);
                None
            }
        };

        let (events, _) = broadcast::channel(32);
        if let Some(adapter) = &adapter {
            Self::spawn_adapter_monitor(adapter.clone(), events.clone());
        }

        Ok(Self {
            session,
            adapter,
            config,
            events,
        })
    }

    fn spawn_adapter_monitor(adapter: Adapter, events: broadcast::Sender<BackendEvent>) {
        tokio::spawn(async move {
            let Ok(mut adapter_events) = adapter.events().await else {
                error!("Failed to get adapter events");
                return;
            };

            while let Some(event) = adapter_events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    let capability = if powered {
                        Capability::Ready
                    } else {
                        Capability::PoweredOff
                    };
                    info!("Adapter {} is now {}", adapter.name(), capability);
                    let _ = events.send(BackendEvent::CapabilityChanged(capability));
                }
            }

            warn!("Adapter {} went away", adapter.name());
            let _ = events.send(BackendEvent::CapabilityChanged(Capability::Unavailable));
        });
    }

    fn adapter(&self) -> Result<&Adapter, PrinterError> {
        self.adapter
            .as_ref()
            .ok_or(PrinterError::BluetoothUnavailable(Capability::Unavailable))
    }

    fn parse_address(identifier: &str) -> Result<Address, PrinterError> {
        Address::from_str(identifier)
            .map_err(|_| PrinterError::InvalidAddress(identifier.to_string()))
    }

    /// Opens a stream through BlueZ's profile manager, which performs the
    /// SDP lookup for `uuid`.
    async fn connect_service(&self, address: Address, uuid: Uuid) -> Result<(Stream, ProfileHandle)> {
        let profile = Profile {
            uuid,
            role: Some(Role::Client),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        };
        let mut handle = self.session.register_profile(profile).await?;
        let device = self.adapter()?.device(address)?;

        let connect = async {
            device.connect_profile(&uuid).await?;
            Ok::<_, anyhow::Error>(())
        };
        let accept = async {
            let request = handle
                .next()
                .await
                .ok_or_else(|| anyhow!("profile registration ended before connecting"))?;
            debug!("Connect request from {}", request.device());
            Ok::<_, anyhow::Error>(request.accept()?)
        };
        let stream = accept_while_connecting(connect, accept).await?;
        Ok((stream, handle))
    }
}

/// Runs ConnectProfile and the profile's accept side together.
///
/// BlueZ hands the socket to the profile while ConnectProfile is still
/// pending. A failed ConnectProfile never produces a request, so its error
/// ends the whole operation.
async fn accept_while_connecting<T>(
    connect: impl Future<Output = Result<()>>,
    accept: impl Future<Output = Result<T>>,
) -> Result<T> {
    let ((), accepted) = tokio::try_join!(connect, accept)?;
    Ok(accepted)
}

fn to_printer_error(e: bluer::Error) -> PrinterError {
    match e.kind {
        ErrorKind::NotAuthorized | ErrorKind::NotPermitted => {
            PrinterError::PermissionDenied(e.to_string())
        }
        _ => PrinterError::ScanFailed(e.to_string()),
    }
}

#[async_trait]
impl BluetoothBackend for RfcommBackend {
    fn model(&self) -> DeviceModel {
        DeviceModel::AddressBook
    }

    async fn capability(&self) -> Capability {
        let Some(adapter) = &self.adapter else {
            return Capability::Unavailable;
        };
        match adapter.is_powered().await {
            Ok(true) => Capability::Ready,
            Ok(false) => Capability::PoweredOff,
            Err(e) => {
                warn!("Failed to query adapter state: {}", e);
                Capability::Unavailable
            }
        }
    }

    async fn check_permission(&self) -> Result<(), PrinterError> {
        match self.adapter()?.is_powered().await {
            Err(e) if matches!(e.kind, ErrorKind::NotAuthorized | ErrorKind::NotPermitted) => {
                Err(PrinterError::PermissionDenied(e.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceDescriptor>, PrinterError> {
        let adapter = self.adapter()?;
        let addresses = adapter.device_addresses().await.map_err(to_printer_error)?;

        let mut devices = Vec::new();
        for address in addresses {
            let device = adapter.device(address).map_err(to_printer_error)?;
            if !device.is_paired().await.unwrap_or(false) {
                continue;
            }
            let name = device.name().await.ok().flatten();
            debug!("Bonded device: {:?} ({})", name, address);
            devices.push(DeviceDescriptor::new(address.to_string(), name, true));
        }
        Ok(devices)
    }

    async fn scan(&self) -> Result<BoxStream<'static, DeviceDescriptor>, PrinterError> {
        let adapter = self.adapter()?.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let discovery = match adapter.discover_devices().await {
                Ok(discovery) => discovery,
                Err(e) => {
                    error!("Failed to start discovery: {}", e);
                    return;
                }
            };
            tokio::pin!(discovery);
            info!("Bluetooth discovery started");

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = discovery.next() => {
                        let Some(event) = event else { break };
                        let AdapterEvent::DeviceAdded(address) = event else { continue };
                        let Ok(device) = adapter.device(address) else { continue };
                        let name = device.name().await.ok().flatten();
                        let paired = device.is_paired().await.unwrap_or(false);
                        if tx.send(DeviceDescriptor::new(address.to_string(), name, paired)).is_err() {
                            break;
                        }
                    }
                }
            }
            info!("Bluetooth discovery stopped");
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|device| (device, rx))
        })
        .boxed())
    }

    fn validate_identifier(&self, identifier: &str) -> Result<(), PrinterError> {
        if !is_valid_mac_address(identifier) {
            return Err(PrinterError::InvalidAddress(identifier.to_string()));
        }
        Self::parse_address(identifier).map(|_| ())
    }

    async fn resolve(&self, identifier: &str) -> Result<Option<DeviceDescriptor>, PrinterError> {
        let address = Self::parse_address(identifier)?;
        let device = self.adapter()?.device(address).map_err(to_printer_error)?;
        match device.is_paired().await {
            Ok(paired) => {
                let name = device.name().await.ok().flatten();
                Ok(Some(DeviceDescriptor::new(address.to_string(), name, paired)))
            }
            Err(e) => {
                debug!("Device {} is unknown to BlueZ: {}", address, e);
                Ok(None)
            }
        }
    }

    fn connect_strategies(&self) -> Vec<ConnectStrategy> {
        vec![
            ConnectStrategy::ServiceRecord(UUID_SERIAL_PORT_PROFILE),
            ConnectStrategy::ServiceRecord(self.config.alternate_service_uuid),
            ConnectStrategy::DirectChannel(self.config.fallback_rfcomm_channel),
        ]
    }

    async fn establish(
        &self,
        device: &DeviceDescriptor,
        strategy: &ConnectStrategy,
    ) -> Result<Box<dyn Link>> {
        let address = Self::parse_address(&device.identifier)?;

        let (stream, profile) = match strategy {
            ConnectStrategy::ServiceRecord(uuid) => {
                let (stream, handle) = self.connect_service(address, *uuid).await?;
                (stream, Some(handle))
            }
            ConnectStrategy::DirectChannel(channel) => {
                (Stream::connect(SocketAddr::new(address, *channel)).await?, None)
            }
            ConnectStrategy::Gatt => bail!("GATT is not available on RFCOMM backends"),
        };

        Ok(Box::new(RfcommLink::new(
            device.identifier.clone(),
            stream,
            profile,
            self.events.clone(),
        )))
    }

    fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}

/// RFCOMM stream to one printer
pub struct RfcommLink {
    writer: OwnedWriteHalf,
    live: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    /// Keeps the profile registered while the socket is open
    _profile: Option<ProfileHandle>,
    closed: bool,
}

impl RfcommLink {
    fn new(
        identifier: String,
        stream: Stream,
        profile: Option<ProfileHandle>,
        events: broadcast::Sender<BackendEvent>,
    ) -> Self {
        let (mut read_half, writer) = stream.into_split();
        let live = Arc::new(AtomicBool::new(true));

        // Printers rarely talk back; the reader exists to notice EOF.
        let reader_live = live.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => debug!("Received {} bytes from {}", n, identifier),
                    Err(e) => {
                        debug!("Read from {} failed: {}", identifier, e);
                        break;
                    }
                }
            }
            if reader_live.swap(false, Ordering::SeqCst) {
                info!("Connection to {} lost", identifier);
                let _ = events.send(BackendEvent::DeviceDisconnected(identifier));
            }
        });

        Self {
            writer,
            live,
            reader,
            _profile: profile,
            closed: false,
        }
    }
}

#[async_trait]
impl Link for RfcommLink {
    async fn bind_channel(&mut self) -> Result<(), PrinterError> {
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Our own close must not surface as an unsolicited disconnect.
        self.live.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.writer.shutdown().await?;
        Ok(())
    }

    fn is_live(&self) -> bool {
        !self.closed && self.live.load(Ordering::SeqCst)
    }
}

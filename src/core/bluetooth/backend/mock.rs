//! Scriptable in-memory backend.
//!
//! Used by the test suite and by the demo binary's `--mock` mode. Every
//! hardware decision (capability, permission, handshake outcome and delay,
//! GATT layout) is set by the caller, and every side effect is counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use log::debug;
use tokio::sync::broadcast;

use crate::core::bluetooth::backend::{
    BackendEvent, BluetoothBackend, ConnectStrategy, Link, is_valid_mac_address,
};
use crate::core::bluetooth::constants::{DEFAULT_RFCOMM_CHANNEL, UUID_SERIAL_PORT_PROFILE};
use crate::core::bluetooth::error::PrinterError;
use crate::core::bluetooth::types::{Capability, DeviceDescriptor, DeviceModel};

/// Outcome of one scripted handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Opens a link after the delay
    Succeed(Duration),
    /// Fails with `reason` after the delay
    Fail(Duration, String),
    /// Never completes
    Hang,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::Succeed(Duration::ZERO)
    }
}

/// What enumeration finds on a broadcast device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GattLayout {
    #[default]
    Writable,
    NoServices,
    ReadOnly,
    /// Service discovery itself errors out
    DiscoveryError,
    /// Enumeration never completes
    Stalled,
}

/// Side effects observed by the mock
#[derive(Debug, Default)]
pub struct MockCounters {
    pub capability_queries: AtomicUsize,
    pub establish_calls: AtomicUsize,
    pub links_opened: AtomicUsize,
    pub links_closed: AtomicUsize,
    pub scans_started: AtomicUsize,
    pub scans_stopped: AtomicUsize,
    pub active_scans: AtomicUsize,
    pub max_concurrent_scans: AtomicUsize,
}

#[derive(Debug, Default)]
struct Script {
    bonded: Vec<DeviceDescriptor>,
    known: Vec<DeviceDescriptor>,
    advertisements: Vec<(Duration, DeviceDescriptor)>,
    strategies: Vec<ConnectStrategy>,
    strategy_handshakes: HashMap<ConnectStrategy, Handshake>,
    device_handshakes: HashMap<String, Handshake>,
    gatt_layout: GattLayout,
    attempts: Vec<(String, ConnectStrategy)>,
    written: Vec<u8>,
    live_links: Vec<(String, Arc<AtomicBool>)>,
}

struct MockState {
    model: DeviceModel,
    capability: Mutex<Capability>,
    permission_granted: AtomicBool,
    script: Mutex<Script>,
    counters: MockCounters,
    events: broadcast::Sender<BackendEvent>,
}

impl MockState {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory [`BluetoothBackend`]
#[derive(Clone)]
pub struct MockBackend {
    state: Arc<MockState>,
}

impl MockBackend {
    pub fn new(model: DeviceModel) -> Self {
        let strategies = match model {
            DeviceModel::AddressBook => vec![
                ConnectStrategy::ServiceRecord(UUID_SERIAL_PORT_PROFILE),
                ConnectStrategy::DirectChannel(DEFAULT_RFCOMM_CHANNEL),
            ],
            DeviceModel::Broadcast => vec![ConnectStrategy::Gatt],
        };
        let (events, _) = broadcast::channel(32);

        Self {
            state: Arc::new(MockState {
                model,
                capability: Mutex::new(Capability::Ready),
                permission_granted: AtomicBool::new(true),
                script: Mutex::new(Script {
                    strategies,
                    ..Default::default()
                }),
                counters: MockCounters::default(),
                events,
            }),
        }
    }

    /// Bluetooth Classic style backend
    pub fn address_book() -> Self {
        Self::new(DeviceModel::AddressBook)
    }

    /// Bluetooth LE style backend
    pub fn broadcast() -> Self {
        Self::new(DeviceModel::Broadcast)
    }

    /// Adds a bonded device
    pub fn with_bonded(self, device: DeviceDescriptor) -> Self {
        self.state.script().bonded.push(device);
        self
    }

    /// Adds a device the platform can look up but that is not bonded
    pub fn with_known(self, device: DeviceDescriptor) -> Self {
        self.state.script().known.push(device);
        self
    }

    /// Adds a device that advertises `after` the scan starts
    pub fn with_advertisement(self, device: DeviceDescriptor, after: Duration) -> Self {
        self.state.script().advertisements.push((after, device));
        self
    }

    pub fn with_strategies(self, strategies: Vec<ConnectStrategy>) -> Self {
        self.state.script().strategies = strategies;
        self
    }

    pub fn with_handshake(self, strategy: ConnectStrategy, handshake: Handshake) -> Self {
        self.set_handshake(strategy, handshake);
        self
    }

    /// Overrides the handshake for every strategy towards `identifier`
    pub fn with_device_handshake(self, identifier: &str, handshake: Handshake) -> Self {
        self.state
            .script()
            .device_handshakes
            .insert(identifier.to_string(), handshake);
        self
    }

    pub fn with_gatt_layout(self, layout: GattLayout) -> Self {
        self.state.script().gatt_layout = layout;
        self
    }

    pub fn with_permission(self, granted: bool) -> Self {
        self.state.permission_granted.store(granted, Ordering::SeqCst);
        self
    }

    /// Sets the capability without publishing an event
    pub fn with_capability(self, capability: Capability) -> Self {
        *self
            .state
            .capability
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = capability;
        self
    }

    /// Layout seen by links that start enumerating from now on
    pub fn set_gatt_layout(&self, layout: GattLayout) {
        self.state.script().gatt_layout = layout;
    }

    pub fn set_handshake(&self, strategy: ConnectStrategy, handshake: Handshake) {
        self.state
            .script()
            .strategy_handshakes
            .insert(strategy, handshake);
    }

    /// Changes the capability and publishes the change
    pub fn set_capability(&self, capability: Capability) {
        *self
            .state
            .capability
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = capability;
        if !capability.is_ready() {
            for (_, live) in self.state.script().live_links.drain(..) {
                live.store(false, Ordering::SeqCst);
            }
        }
        let _ = self
            .state
            .events
            .send(BackendEvent::CapabilityChanged(capability));
    }

    /// Simulates the printer dropping the connection
    pub fn disconnect_device(&self, identifier: &str) {
        self.state.script().live_links.retain(|(id, live)| {
            if id == identifier {
                live.store(false, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
        let _ = self
            .state
            .events
            .send(BackendEvent::DeviceDisconnected(identifier.to_string()));
    }

    pub fn counters(&self) -> &MockCounters {
        &self.state.counters
    }

    /// `(identifier, strategy)` of every establish call, in order
    pub fn attempts(&self) -> Vec<(String, ConnectStrategy)> {
        self.state.script().attempts.clone()
    }

    /// Every byte written to any link
    pub fn written(&self) -> Vec<u8> {
        self.state.script().written.clone()
    }

    /// Links opened and not yet closed
    pub fn open_links(&self) -> usize {
        let counters = &self.state.counters;
        let opened = counters.links_opened.load(Ordering::SeqCst);
        opened.saturating_sub(counters.links_closed.load(Ordering::SeqCst))
    }

    fn handshake_for(&self, identifier: &str, strategy: &ConnectStrategy) -> Handshake {
        let script = self.state.script();
        script
            .device_handshakes
            .get(identifier)
            .or_else(|| script.strategy_handshakes.get(strategy))
            .cloned()
            .unwrap_or_default()
    }
}

/// Keeps the active-scan count accurate when the stream is dropped
struct ScanGuard(Arc<MockState>);

impl ScanGuard {
    fn start(state: Arc<MockState>) -> Self {
        let counters = &state.counters;
        counters.scans_started.fetch_add(1, Ordering::SeqCst);
        let active = counters.active_scans.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_concurrent_scans.fetch_max(active, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        let counters = &self.0.counters;
        counters.active_scans.fetch_sub(1, Ordering::SeqCst);
        counters.scans_stopped.fetch_add(1, Ordering::SeqCst);
        debug!("Mock scan stopped");
    }
}

#[async_trait]
impl BluetoothBackend for MockBackend {
    fn model(&self) -> DeviceModel {
        self.state.model
    }

    fn platform_version(&self) -> String {
        "Mock 1.0".to_string()
    }

    async fn capability(&self) -> Capability {
        self.state
            .counters
            .capability_queries
            .fetch_add(1, Ordering::SeqCst);
        *self
            .state
            .capability
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn check_permission(&self) -> Result<(), PrinterError> {
        if self.state.permission_granted.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PrinterError::PermissionDenied(
                "Bluetooth connect permission not granted".to_string(),
            ))
        }
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceDescriptor>, PrinterError> {
        Ok(self.state.script().bonded.clone())
    }

    async fn scan(&self) -> Result<BoxStream<'static, DeviceDescriptor>, PrinterError> {
        let mut advertisements = self.state.script().advertisements.clone();
        advertisements.sort_by_key(|(after, _)| *after);

        let guard = ScanGuard::start(self.state.clone());
        let started = tokio::time::Instant::now();

        let stream = stream::unfold(
            (advertisements.into_iter(), guard),
            move |(mut pending, guard)| async move {
                match pending.next() {
                    Some((after, device)) => {
                        tokio::time::sleep_until(started + after).await;
                        Some((device, (pending, guard)))
                    }
                    // Real radios keep scanning after the last advertisement.
                    None => {
                        futures_util::future::pending::<()>().await;
                        None
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    fn validate_identifier(&self, identifier: &str) -> Result<(), PrinterError> {
        if self.state.model == DeviceModel::AddressBook && !is_valid_mac_address(identifier) {
            return Err(PrinterError::InvalidAddress(identifier.to_string()));
        }
        Ok(())
    }

    async fn resolve(&self, identifier: &str) -> Result<Option<DeviceDescriptor>, PrinterError> {
        if self.state.model == DeviceModel::Broadcast {
            return Ok(None);
        }
        let script = self.state.script();
        Ok(script
            .bonded
            .iter()
            .chain(script.known.iter())
            .find(|device| device.identifier == identifier)
            .cloned())
    }

    fn connect_strategies(&self) -> Vec<ConnectStrategy> {
        self.state.script().strategies.clone()
    }

    async fn establish(
        &self,
        device: &DeviceDescriptor,
        strategy: &ConnectStrategy,
    ) -> Result<Box<dyn Link>> {
        self.state
            .counters
            .establish_calls
            .fetch_add(1, Ordering::SeqCst);
        self.state
            .script()
            .attempts
            .push((device.identifier.clone(), strategy.clone()));

        match self.handshake_for(&device.identifier, strategy) {
            Handshake::Succeed(delay) => tokio::time::sleep(delay).await,
            Handshake::Fail(delay, reason) => {
                tokio::time::sleep(delay).await;
                bail!(reason);
            }
            Handshake::Hang => futures_util::future::pending::<()>().await,
        }

        let live = Arc::new(AtomicBool::new(true));
        self.state
            .script()
            .live_links
            .push((device.identifier.clone(), live.clone()));
        self.state
            .counters
            .links_opened
            .fetch_add(1, Ordering::SeqCst);
        debug!("Mock link to {} opened via {}", device.identifier, strategy);

        Ok(Box::new(MockLink {
            identifier: device.identifier.clone(),
            state: self.state.clone(),
            live,
            bound: false,
            closed: false,
        }))
    }

    fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.state.events.subscribe()
    }
}

/// Link handed out by [`MockBackend`]
pub struct MockLink {
    identifier: String,
    state: Arc<MockState>,
    live: Arc<AtomicBool>,
    bound: bool,
    closed: bool,
}

#[async_trait]
impl Link for MockLink {
    async fn bind_channel(&mut self) -> Result<(), PrinterError> {
        if self.state.model == DeviceModel::AddressBook {
            return Ok(());
        }
        let layout = self.state.script().gatt_layout;
        match layout {
            GattLayout::Writable => {
                self.bound = true;
                Ok(())
            }
            GattLayout::NoServices => Err(PrinterError::NoServicesFound),
            GattLayout::ReadOnly => Err(PrinterError::NoWritableCharacteristic),
            GattLayout::DiscoveryError => Err(PrinterError::ServiceDiscoveryFailed(
                "GATT operation failed".to_string(),
            )),
            GattLayout::Stalled => {
                futures_util::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.is_live() {
            bail!("link to {} is closed", self.identifier);
        }
        if self.state.model == DeviceModel::Broadcast && !self.bound {
            return Err(anyhow!("no writable characteristic bound"));
        }
        self.state.script().written.extend_from_slice(bytes);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.live.store(false, Ordering::SeqCst);
        self.state
            .script()
            .live_links
            .retain(|(_, live)| !Arc::ptr_eq(live, &self.live));
        self.state
            .counters
            .links_closed
            .fetch_add(1, Ordering::SeqCst);
        debug!("Mock link to {} closed", self.identifier);
        Ok(())
    }

    fn is_live(&self) -> bool {
        !self.closed && self.live.load(Ordering::SeqCst)
    }
}

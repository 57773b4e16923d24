#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use thermal_printer_link::core::bluetooth::backend::mock::MockBackend;
use thermal_printer_link::{DeviceDescriptor, PrinterConfig, PrinterEvent, PrinterManager, SessionState};
use tokio::sync::broadcast;

pub const PRINTER_A: &str = "AA:BB:CC:DD:EE:01";
pub const PRINTER_B: &str = "AA:BB:CC:DD:EE:02";

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Short timeouts so failure paths finish quickly
pub fn fast_config() -> PrinterConfig {
    PrinterConfig::default()
        .with_listing_scan_timeout(ms(150))
        .with_lookup_scan_timeout(ms(150))
        .with_connect_timeout(ms(100))
        .with_enumeration_timeout(ms(100))
}

pub fn bonded(identifier: &str, name: &str) -> DeviceDescriptor {
    DeviceDescriptor::new(identifier, Some(name.to_string()), true)
}

pub fn advertised(identifier: &str) -> DeviceDescriptor {
    DeviceDescriptor::new(identifier, Some(format!("BLE {}", identifier)), false)
}

pub fn manager(backend: &MockBackend, config: PrinterConfig) -> Arc<PrinterManager> {
    Arc::new(PrinterManager::new(Arc::new(backend.clone()), config))
}

/// Waits for the first event matching `predicate`
pub async fn next_event(
    events: &mut broadcast::Receiver<PrinterEvent>,
    predicate: impl Fn(&PrinterEvent) -> bool,
) -> Option<PrinterEvent> {
    tokio::time::timeout(ms(1_000), async {
        while let Ok(event) = events.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Waits until the session reaches `state`
pub async fn wait_for_state(manager: &PrinterManager, state: SessionState) {
    let mut watch = manager.watch_state();
    tokio::time::timeout(ms(1_000), watch.wait_for(|current| *current == state))
        .await
        .expect("state not reached in time")
        .expect("session worker stopped");
}

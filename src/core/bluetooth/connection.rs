//! Bluetooth connection handling for printers
//! This module opens a transport to a resolved device, walking the backend's
//! connect strategies with a timeout guard around each handshake.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PrinterConfig;
use crate::core::bluetooth::backend::{BluetoothBackend, ConnectStrategy, Link};
use crate::core::bluetooth::constants::CONNECTION_FAILED_HINT;
use crate::core::bluetooth::error::PrinterError;
use crate::core::bluetooth::types::{DeviceDescriptor, DeviceModel};

type Handshake = JoinHandle<anyhow::Result<Box<dyn Link>>>;

/// Outcome of one strategy
enum AttemptError {
    TimedOut,
    Failed(anyhow::Error),
    Cancelled,
}

/// Connection manager for printers
#[derive(Clone)]
pub struct ConnectionManager {
    backend: Arc<dyn BluetoothBackend>,
    config: PrinterConfig,
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn BluetoothBackend>, config: PrinterConfig) -> Self {
        Self { backend, config }
    }

    /// Timeout guarding a single handshake
    pub fn attempt_timeout(&self) -> Duration {
        match self.backend.model() {
            DeviceModel::AddressBook => self.config.stream_connect_timeout(),
            DeviceModel::Broadcast => self.config.gatt_connect_timeout(),
        }
    }

    /// Strategies to try, in order
    pub fn strategies(&self) -> Vec<ConnectStrategy> {
        let mut strategies = self.backend.connect_strategies();
        if !self.config.enable_fallback_strategies {
            strategies.truncate(1);
        }
        strategies
    }

    /// Opens a transport to `device`.
    ///
    /// Each strategy gets its own timeout. A strategy that fails or times
    /// out hands over to the next one; a link that shows up after its
    /// strategy was abandoned is closed, never returned.
    pub async fn establish(
        &self,
        device: &DeviceDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Link>, PrinterError> {
        let strategies = self.strategies();
        let timeout = self.attempt_timeout();
        let mut last_error: Option<anyhow::Error> = None;
        let mut all_timed_out = true;

        for (index, strategy) in strategies.iter().enumerate() {
            info!(
                "Connecting to {} using {} (attempt {}/{})",
                device.identifier,
                strategy,
                index + 1,
                strategies.len()
            );

            match self.try_strategy(device, strategy, timeout, cancel).await {
                Ok(link) => {
                    info!("Successfully connected to {} using {}", device.identifier, strategy);
                    return Ok(link);
                }
                Err(AttemptError::Cancelled) => {
                    info!("Connection attempt to {} cancelled", device.identifier);
                    return Err(PrinterError::Cancelled);
                }
                Err(AttemptError::TimedOut) => {
                    warn!("{} to {} timed out after {:?}", strategy, device.identifier, timeout);
                    last_error = Some(anyhow!("timed out after {:?}", timeout));
                }
                Err(AttemptError::Failed(e)) => {
                    warn!("{} to {} failed: {}", strategy, device.identifier, e);
                    all_timed_out = false;
                    last_error = Some(e);
                }
            }
        }

        if all_timed_out && !strategies.is_empty() {
            error!("Connection to {} timed out", device.identifier);
            let capability = self.backend.capability().await;
            return Err(PrinterError::ConnectionTimeout(format!(
                "Connection to device timed out after {:?}. Bluetooth: {}, Device: {}, ID: {}. \
                 Please ensure the printer is turned on, in range, and in pairing mode.",
                timeout,
                capability,
                device.display_name(),
                device.identifier
            )));
        }

        let cause = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no connect strategy available".to_string());
        error!("All connection methods failed for {}: {}", device.identifier, cause);
        let reason = format!(
            "{} (Device: {}, ID: {})",
            cause,
            device.display_name(),
            device.identifier
        );
        Err(PrinterError::ConnectionFailed {
            reason,
            hint: CONNECTION_FAILED_HINT.to_string(),
        })
    }

    async fn try_strategy(
        &self,
        device: &DeviceDescriptor,
        strategy: &ConnectStrategy,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Link>, AttemptError> {
        let backend = self.backend.clone();
        let target = device.clone();
        let chosen = strategy.clone();
        let mut handshake: Handshake =
            tokio::spawn(async move { backend.establish(&target, &chosen).await });

        // The handshake is polled first so a result that is ready together
        // with the timer still wins.
        tokio::select! {
            biased;
            joined = &mut handshake => match joined {
                Ok(Ok(link)) => Ok(link),
                Ok(Err(e)) => Err(AttemptError::Failed(e)),
                Err(e) => Err(AttemptError::Failed(anyhow!("handshake task failed: {}", e))),
            },
            _ = tokio::time::sleep(timeout) => {
                Self::discard_late(handshake, device.identifier.clone());
                Err(AttemptError::TimedOut)
            }
            _ = cancel.cancelled() => {
                Self::discard_late(handshake, device.identifier.clone());
                Err(AttemptError::Cancelled)
            }
        }
    }

    /// Lets an abandoned handshake finish in the background and closes
    /// whatever it opened.
    fn discard_late(handshake: Handshake, identifier: String) {
        tokio::spawn(async move {
            if let Ok(Ok(mut link)) = handshake.await {
                warn!("Discarding late connection to {}", identifier);
                if let Err(e) = link.close().await {
                    error!("Error closing late connection to {}: {}", identifier, e);
                }
            }
        });
    }
}

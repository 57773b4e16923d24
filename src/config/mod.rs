//! Printer connection configuration, stored as JSON in the user's config
//! directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::core::bluetooth::{
    DEFAULT_ENUMERATION_TIMEOUT_MS, DEFAULT_GATT_CONNECT_TIMEOUT_MS,
    DEFAULT_LISTING_SCAN_TIMEOUT_MS, DEFAULT_LOOKUP_SCAN_TIMEOUT_MS, DEFAULT_RFCOMM_CHANNEL,
    DEFAULT_STREAM_CONNECT_TIMEOUT_MS, UUID_SERIAL_PORT_PROFILE,
};
use crate::utils::ensure_directory_exists;

const CONFIG_DIR_NAME: &str = "thermal_printer_link";
const CONFIG_FILE_NAME: &str = "printer_config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    /// How long `getBondedDevices` scans on broadcast-model backends.
    pub listing_scan_timeout_ms: u64,

    /// How long a connect may scan for a device missing from the directory.
    pub lookup_scan_timeout_ms: u64,

    /// Timeout applied to each stream-socket connect strategy.
    pub stream_connect_timeout_ms: u64,

    /// Timeout applied to the GATT connect handshake.
    pub gatt_connect_timeout_ms: u64,

    /// Timeout for locating a writable characteristic after connecting.
    pub enumeration_timeout_ms: u64,

    /// Try the alternate service record and direct channel when the
    /// primary strategy fails.
    pub enable_fallback_strategies: bool,

    /// Service class tried by the alternate strategy.
    pub alternate_service_uuid: Uuid,

    /// Channel used by the direct-channel strategy.
    pub fallback_rfcomm_channel: u8,

    /// Default log level, overridden by `RUST_LOG`.
    pub log_level: String,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        PrinterConfig {
            listing_scan_timeout_ms: DEFAULT_LISTING_SCAN_TIMEOUT_MS,
            lookup_scan_timeout_ms: DEFAULT_LOOKUP_SCAN_TIMEOUT_MS,
            stream_connect_timeout_ms: DEFAULT_STREAM_CONNECT_TIMEOUT_MS,
            gatt_connect_timeout_ms: DEFAULT_GATT_CONNECT_TIMEOUT_MS,
            enumeration_timeout_ms: DEFAULT_ENUMERATION_TIMEOUT_MS,
            enable_fallback_strategies: true,
            alternate_service_uuid: UUID_SERIAL_PORT_PROFILE,
            fallback_rfcomm_channel: DEFAULT_RFCOMM_CHANNEL,
            log_level: "info".to_string(),
        }
    }
}

impl PrinterConfig {
    pub fn listing_scan_timeout(&self) -> Duration {
        Duration::from_millis(self.listing_scan_timeout_ms)
    }

    pub fn lookup_scan_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_scan_timeout_ms)
    }

    pub fn stream_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_connect_timeout_ms)
    }

    pub fn gatt_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.gatt_connect_timeout_ms)
    }

    pub fn enumeration_timeout(&self) -> Duration {
        Duration::from_millis(self.enumeration_timeout_ms)
    }

    pub fn with_listing_scan_timeout(mut self, timeout: Duration) -> Self {
        self.listing_scan_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_lookup_scan_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_scan_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets both the stream and the GATT connect timeouts
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.stream_connect_timeout_ms = timeout.as_millis() as u64;
        self.gatt_connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_enumeration_timeout(mut self, timeout: Duration) -> Self {
        self.enumeration_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_fallback_strategies(mut self, enabled: bool) -> Self {
        self.enable_fallback_strategies = enabled;
        self
    }

    /// Default location of the config file
    pub fn default_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow!("No config directory on this platform"))?;
        Ok(config_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Loads the config from `path`, falling back to defaults if it is missing.
    pub async fn load_config(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file not found at {:?}, using default.", path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", path);
        Ok(config)
    }

    /// Saves the current config to `path`.
    pub async fn save_config(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            ensure_directory_exists(parent).await?;
        }

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize printer config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(path, config_json).await?;

        info!("Printer config saved to {:?}.", path);
        Ok(())
    }
}

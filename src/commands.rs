//! Host method calls
//! This module maps the method-call surface exposed to the host application
//! onto [`PrinterManager`] operations.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::PrinterManager;
use crate::core::bluetooth::PrinterError;

/// A call from the host: a method name and its arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }

    fn string_argument(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

/// Error result delivered to the host: a stable code and a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodError {
    pub code: String,
    pub message: String,
}

impl From<PrinterError> for MethodError {
    fn from(e: PrinterError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Dispatches a host method call.
///
/// # Methods
/// - `getPlatformVersion` -> `"<OS> <release>"`
/// - `getBondedDevices` -> `[{name, address}]`
/// - `connect {address}` -> `true`
/// - `disconnect` -> `true` if a session was torn down
/// - `isConnected` -> bool
pub async fn handle_method_call(
    manager: &PrinterManager,
    call: &MethodCall,
) -> Result<Value, MethodError> {
    debug!("Method call: {}", call.method);

    match call.method.as_str() {
        "getPlatformVersion" => Ok(json!(manager.platform_version())),
        "getBondedDevices" => {
            let devices = manager.bonded_devices().await?;
            Ok(json!(devices))
        }
        "connect" => {
            let connected = manager.connect(call.string_argument("address")).await?;
            Ok(json!(connected))
        }
        "disconnect" => Ok(json!(manager.disconnect().await)),
        "isConnected" => Ok(json!(manager.is_connected().await)),
        other => {
            warn!("Unknown method call: {}", other);
            Err(PrinterError::NotImplemented(other.to_string()).into())
        }
    }
}

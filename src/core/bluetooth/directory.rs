//! In-memory catalog of known printers, keyed by identifier.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;
use tokio::sync::watch;

use crate::core::bluetooth::types::DeviceDescriptor;

/// Shared device directory
///
/// Advertisement callbacks write into it while unrelated connect attempts
/// read from it, so every access goes through the lock.
#[derive(Debug, Clone)]
pub struct DeviceDirectory {
    devices: Arc<RwLock<HashMap<String, DeviceDescriptor>>>,
    // Bumped on every insert.
    inserted: Arc<watch::Sender<u64>>,
}

impl Default for DeviceDirectory {
    fn default() -> Self {
        let (inserted, _) = watch::channel(0);
        Self {
            devices: Arc::default(),
            inserted: Arc::new(inserted),
        }
    }
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver that changes whenever a device is inserted
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inserted.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, DeviceDescriptor>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, DeviceDescriptor>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or overwrites a device. Returns `true` if it was not known yet.
    pub fn insert(&self, device: DeviceDescriptor) -> bool {
        let identifier = device.identifier.clone();
        let is_new = self.write().insert(identifier.clone(), device).is_none();
        self.inserted.send_modify(|count| *count += 1);
        if is_new {
            debug!("Directory: added {}", identifier);
        }
        is_new
    }

    pub fn get(&self, identifier: &str) -> Option<DeviceDescriptor> {
        self.read().get(identifier).cloned()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.read().contains_key(identifier)
    }

    /// Starts a new epoch
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Replaces the whole directory with `devices`
    pub fn replace_all(&self, devices: impl IntoIterator<Item = DeviceDescriptor>) {
        let mut guard = self.write();
        guard.clear();
        for device in devices {
            guard.insert(device.identifier.clone(), device);
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rediscovery_overwrites() {
        let directory = DeviceDirectory::new();
        assert!(directory.insert(DeviceDescriptor::new("id-1", None, false)));
        assert!(!directory.insert(DeviceDescriptor::new(
            "id-1",
            Some("Printer".to_string()),
            false
        )));

        assert_eq!(directory.len(), 1);
        assert_eq!(
            directory.get("id-1").unwrap().name.as_deref(),
            Some("Printer")
        );
    }

    #[test]
    fn test_replace_all_starts_new_epoch() {
        let directory = DeviceDirectory::new();
        directory.insert(DeviceDescriptor::new("old", None, true));
        directory.replace_all(vec![
            DeviceDescriptor::new("a", None, true),
            DeviceDescriptor::new("b", None, true),
        ]);

        assert!(!directory.contains("old"));
        assert_eq!(directory.len(), 2);

        directory.clear();
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_see_inserts() {
        let directory = DeviceDirectory::new();
        let mut inserted = directory.subscribe();

        let writer = directory.clone();
        tokio::spawn(async move {
            writer.insert(DeviceDescriptor::new("id-1", None, false));
        });

        inserted.changed().await.unwrap();
        assert!(directory.contains("id-1"));
    }
}

//! Device descriptions learned during boot runs
//!
//! A run reads the device's own manufacturer and product strings after
//! claiming it. The adapter shows them for as long as the connection is
//! listed, which outlives the progress entry.

use crate::usb::RawDeviceHandle;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared description table, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct DeviceNames {
    entries: Arc<RwLock<HashMap<RawDeviceHandle, String>>>,
}

impl DeviceNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, handle: RawDeviceHandle, description: String) {
        self.entries.write().await.insert(handle, description);
    }

    pub async fn get(&self, handle: RawDeviceHandle) -> Option<String> {
        self.entries.read().await.get(&handle).cloned()
    }

    /// Forget every connection not in `present`
    pub async fn retain(&self, present: &HashSet<RawDeviceHandle>) {
        self.entries
            .write()
            .await
            .retain(|handle, _| present.contains(handle));
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

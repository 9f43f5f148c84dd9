//! Per-connection boot progress
//!
//! Every in-flight run owns one entry, keyed by the connection's
//! [`RawDeviceHandle`]. The entry is the run-exclusivity token: a run only
//! starts if [`ProgressTable::try_begin`] inserted its entry.

use crate::usb::RawDeviceHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Shared progress table, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct ProgressTable {
    entries: Arc<RwLock<HashMap<RawDeviceHandle, u8>>>,
}

impl ProgressTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a connection at 0%, `false` if a run already owns it
    pub async fn try_begin(&self, handle: RawDeviceHandle) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&handle) {
            return false;
        }
        entries.insert(handle, 0);
        true
    }

    /// Update the percentage, clamped to 100
    pub async fn set(&self, handle: RawDeviceHandle, percent: u8) {
        self.entries.write().await.insert(handle, percent.min(100));
    }

    pub async fn get(&self, handle: RawDeviceHandle) -> Option<u8> {
        self.entries.read().await.get(&handle).copied()
    }

    pub async fn contains(&self, handle: RawDeviceHandle) -> bool {
        self.entries.read().await.contains_key(&handle)
    }

    pub async fn remove(&self, handle: RawDeviceHandle) -> Option<u8> {
        self.entries.write().await.remove(&handle)
    }

    /// Drop the entry once `delay` has passed
    pub fn remove_after(&self, handle: RawDeviceHandle, delay: Duration) -> JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            table.remove(handle).await;
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

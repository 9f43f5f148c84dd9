//! Scanner
//!
//! Polls every subscribed adapter on its own cadence and republishes what
//! they find as one event stream. A `Devices` event always carries the
//! concatenation of the latest snapshots of all adapters, in subscription
//! order.

use crate::adapter::{Adapter, AdapterError, AdapterEvent, DriveRecord};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shortest pause between two scans of the same adapter
pub const MIN_SCAN_DELAY: Duration = Duration::from_millis(500);

/// Capacity of the scanner event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScannerError {
    #[error("An adapter with id {0} is already subscribed")]
    AlreadySubscribed(String),
}

/// Events published by the scanner
#[derive(Debug, Clone)]
pub enum ScannerEvent {
    Start,
    Stop,
    Subscribe(String),
    Unsubscribe(String),
    Devices(Vec<DriveRecord>),
    Error(AdapterError),
}

type AdapterList = Arc<RwLock<Vec<Arc<dyn Adapter>>>>;

/// Aggregates adapters behind one start/stop switch
pub struct Scanner {
    adapters: AdapterList,
    scan_delay: Duration,
    scanning: Arc<AtomicBool>,
    /// Listener and tick tasks, per adapter id
    tasks: HashMap<String, Vec<JoinHandle<()>>>,
    event_tx: async_channel::Sender<ScannerEvent>,
    event_rx: async_channel::Receiver<ScannerEvent>,
}

impl Scanner {
    pub fn new() -> Self {
        Self::with_scan_delay(MIN_SCAN_DELAY)
    }

    /// Delays shorter than [`MIN_SCAN_DELAY`] are raised to it
    pub fn with_scan_delay(scan_delay: Duration) -> Self {
        let (event_tx, event_rx) = async_channel::bounded(EVENT_CHANNEL_CAPACITY);
        Self {
            adapters: Arc::new(RwLock::new(Vec::new())),
            scan_delay: scan_delay.max(MIN_SCAN_DELAY),
            scanning: Arc::new(AtomicBool::new(false)),
            tasks: HashMap::new(),
            event_tx,
            event_rx,
        }
    }

    pub fn scan_delay(&self) -> Duration {
        self.scan_delay
    }

    /// Receiver of scanner events
    ///
    /// Receivers share one queue: each event goes to exactly one of them.
    pub fn events(&self) -> async_channel::Receiver<ScannerEvent> {
        self.event_rx.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Concatenated snapshots of all subscribed adapters
    pub fn devices(&self) -> Vec<DriveRecord> {
        collect_devices(&self.adapters)
    }

    pub fn adapter_ids(&self) -> Vec<String> {
        read_adapters(&self.adapters)
            .iter()
            .map(|a| a.id().to_string())
            .collect()
    }

    pub fn subscribe(&mut self, adapter: Arc<dyn Adapter>) -> Result<(), ScannerError> {
        let id = adapter.id().to_string();
        {
            let mut adapters = match self.adapters.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if adapters.iter().any(|a| a.id() == id) {
                return Err(ScannerError::AlreadySubscribed(id));
            }
            adapters.push(Arc::clone(&adapter));
        }

        debug!("Subscribed adapter {}", id);
        if self.is_scanning() {
            self.spawn_adapter_tasks(adapter);
        }
        emit(&self.event_tx, ScannerEvent::Subscribe(id));
        Ok(())
    }

    /// Remove an adapter by id; unknown ids are ignored
    pub fn unsubscribe(&mut self, id: &str) {
        let removed = {
            let mut adapters = match self.adapters.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let before = adapters.len();
            adapters.retain(|a| a.id() != id);
            adapters.len() != before
        };
        if !removed {
            return;
        }

        if let Some(tasks) = self.tasks.remove(id) {
            for task in tasks {
                task.abort();
            }
        }
        debug!("Unsubscribed adapter {}", id);
        emit(&self.event_tx, ScannerEvent::Unsubscribe(id.to_string()));
    }

    /// Begin scanning every subscribed adapter; no-op when already scanning
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self) {
        if self.scanning.swap(true, Ordering::SeqCst) {
            return;
        }

        let adapters: Vec<Arc<dyn Adapter>> = read_adapters(&self.adapters).clone();
        info!("Scanner starting with {} adapter(s)", adapters.len());
        for adapter in adapters {
            self.spawn_adapter_tasks(adapter);
        }
        emit(&self.event_tx, ScannerEvent::Start);
    }

    /// Stop scanning; no-op when already stopped
    ///
    /// Boot runs already started keep going.
    pub fn stop(&mut self) {
        if !self.scanning.swap(false, Ordering::SeqCst) {
            return;
        }

        self.abort_all();
        info!("Scanner stopped");
        emit(&self.event_tx, ScannerEvent::Stop);
    }

    fn abort_all(&mut self) {
        for (_, tasks) in self.tasks.drain() {
            for task in tasks {
                task.abort();
            }
        }
    }

    fn spawn_adapter_tasks(&mut self, adapter: Arc<dyn Adapter>) {
        let id = adapter.id().to_string();
        // Subscribe before the first scan so its snapshot is not missed
        let mut adapter_events = adapter.events();

        let listener = {
            let adapters = Arc::clone(&self.adapters);
            let event_tx = self.event_tx.clone();
            let id = id.clone();
            tokio::spawn(async move {
                loop {
                    match adapter_events.recv().await {
                        Ok(AdapterEvent::Devices(_)) => {
                            emit(&event_tx, ScannerEvent::Devices(collect_devices(&adapters)));
                        }
                        Ok(AdapterEvent::Error(e)) => {
                            emit(&event_tx, ScannerEvent::Error(e));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            // Skipped errors were logged by the run that raised them
                            warn!("Listener for {} skipped {} adapter events", id, skipped);
                            emit(&event_tx, ScannerEvent::Devices(collect_devices(&adapters)));
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };

        let ticker = {
            let scanning = Arc::clone(&self.scanning);
            let scan_delay = self.scan_delay;
            tokio::spawn(async move {
                while scanning.load(Ordering::SeqCst) {
                    let records = adapter.scan().await;
                    debug!("Adapter {} reported {} device(s)", adapter.id(), records.len());

                    if !scanning.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::time::sleep(scan_delay).await;
                }
            })
        };

        self.tasks.insert(id, vec![listener, ticker]);
    }
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.abort_all();
    }
}

fn read_adapters(
    adapters: &AdapterList,
) -> std::sync::RwLockReadGuard<'_, Vec<Arc<dyn Adapter>>> {
    match adapters.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn collect_devices(adapters: &AdapterList) -> Vec<DriveRecord> {
    read_adapters(adapters)
        .iter()
        .flat_map(|a| a.devices())
        .collect()
}

/// Publish without blocking; `false` if the event was dropped
fn emit(tx: &async_channel::Sender<ScannerEvent>, event: ScannerEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(async_channel::TrySendError::Full(ScannerEvent::Error(e))) => {
            error!("Scanner event queue full, dropping error event: {}", e);
            false
        }
        Err(async_channel::TrySendError::Full(event)) => {
            warn!("Scanner event queue full, dropping {:?}", event);
            false
        }
        // Nobody is listening
        Err(async_channel::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BootError;

    fn adapter_error() -> AdapterError {
        AdapterError {
            adapter: "usbboot".into(),
            device: "001:004".into(),
            source: BootError::TransferFailed,
        }
    }

    #[test]
    fn test_emit_reports_dropped_events() {
        let (tx, rx) = async_channel::bounded(1);

        assert!(emit(&tx, ScannerEvent::Start));
        assert!(!emit(&tx, ScannerEvent::Error(adapter_error())));
        assert!(matches!(rx.try_recv(), Ok(ScannerEvent::Start)));
        assert!(emit(&tx, ScannerEvent::Error(adapter_error())));

        drop(rx);
        assert!(!emit(&tx, ScannerEvent::Stop));
    }
}

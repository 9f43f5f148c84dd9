//! usbboot adapter
//!
//! Finds Compute Modules sitting in the BCM boot ROM (or in the
//! second-stage loader) and starts one boot run per connection. The devices
//! appear in the snapshot as disabled placeholders with live progress until
//! they come back as mass storage and leave the boot identities.

use crate::adapter::{Adapter, AdapterError, AdapterEvent, BoxFuture, DriveIcon, DriveRecord};
use crate::boot::{
    BlobCache, BootContext, BootEngine, BootOutcome, BootTiming, DeviceNames, FileProvider,
    ProgressTable,
};
use crate::usb::{RawDeviceHandle, UsbDevice, UsbTransport};
use common::format_usb_id;
use protocol::{DeviceIdentity, USBBOOT_CAPABLE_DEVICES};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Adapter identifier
pub const USBBOOT_ADAPTER_ID: &str = "usbboot";

/// Placeholder name shown while the device boots
const DISPLAY_NAME: &str = "Initializing device";

/// Description used until the device has named itself
const GENERIC_DESCRIPTION: &str = "Compute Module";

/// Capacity of the event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Tunables of the adapter, fixed at construction
#[derive(Debug, Clone)]
pub struct UsbbootOptions {
    /// New runs started per scan; the rest wait for later scans
    pub max_concurrent_starts: usize,
    pub timing: BootTiming,
    /// Appended to the built-in identity table
    pub extra_identities: Vec<DeviceIdentity>,
}

impl Default for UsbbootOptions {
    fn default() -> Self {
        Self {
            max_concurrent_starts: 5,
            timing: BootTiming::default(),
            extra_identities: Vec::new(),
        }
    }
}

/// Adapter for boot ROM devices
pub struct UsbbootAdapter<T: UsbTransport> {
    transport: Arc<T>,
    ctx: BootContext,
    identities: Vec<DeviceIdentity>,
    max_concurrent_starts: usize,
    /// Connections that already had their one run
    attempted: Mutex<HashSet<RawDeviceHandle>>,
    snapshot: RwLock<Vec<DriveRecord>>,
    events: broadcast::Sender<AdapterEvent>,
}

impl<T: UsbTransport> UsbbootAdapter<T> {
    pub fn new(
        transport: Arc<T>,
        provider: Arc<dyn FileProvider>,
        options: UsbbootOptions,
    ) -> Self {
        let mut identities = USBBOOT_CAPABLE_DEVICES.to_vec();
        for identity in options.extra_identities {
            if !identities.contains(&identity) {
                identities.push(identity);
            }
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            transport,
            ctx: BootContext {
                blobs: Arc::new(BlobCache::new(provider)),
                progress: ProgressTable::new(),
                names: DeviceNames::new(),
                timing: options.timing,
            },
            identities,
            max_concurrent_starts: options.max_concurrent_starts.max(1),
            attempted: Mutex::new(HashSet::new()),
            snapshot: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn progress(&self) -> &ProgressTable {
        &self.ctx.progress
    }

    pub fn names(&self) -> &DeviceNames {
        &self.ctx.names
    }

    pub fn identities(&self) -> &[DeviceIdentity] {
        &self.identities
    }

    fn is_supported(&self, device: &UsbDevice) -> bool {
        self.identities.contains(&device.descriptor.identity())
    }

    async fn list_candidates(&self) -> Vec<UsbDevice> {
        let transport = Arc::clone(&self.transport);
        let devices = match tokio::task::spawn_blocking(move || transport.list_devices()).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Device enumeration task failed: {}", e);
                Vec::new()
            }
        };

        devices.into_iter().filter(|d| self.is_supported(d)).collect()
    }

    /// Forget connections that are gone
    async fn prune(&self, candidates: &[UsbDevice]) {
        let present: HashSet<RawDeviceHandle> =
            candidates.iter().map(UsbDevice::raw_handle).collect();
        {
            let mut attempted = match self.attempted.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            attempted.retain(|handle| present.contains(handle));
        }
        self.ctx.names.retain(&present).await;
    }

    /// Connections still waiting for their run
    fn pending(&self, candidates: &[UsbDevice]) -> Vec<UsbDevice> {
        let attempted = match self.attempted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        candidates
            .iter()
            .filter(|d| !attempted.contains(&d.raw_handle()))
            .cloned()
            .collect()
    }

    fn mark_attempted(&self, handle: RawDeviceHandle) {
        match self.attempted.lock() {
            Ok(mut guard) => guard.insert(handle),
            Err(poisoned) => poisoned.into_inner().insert(handle),
        };
    }

    async fn start_runs(&self, candidates: &[UsbDevice]) {
        let mut started = 0;
        for device in self.pending(candidates) {
            if started >= self.max_concurrent_starts {
                debug!("Start limit reached, deferring remaining devices");
                break;
            }

            let handle = device.raw_handle();
            if !self.ctx.progress.try_begin(handle).await {
                continue;
            }
            self.mark_attempted(handle);
            started += 1;

            info!(
                device = %handle,
                identity = %device.descriptor.identity(),
                "Found usbboot device"
            );
            self.spawn_run(device);
        }
    }

    /// Detached on purpose; the run outlives the scan that started it
    fn spawn_run(&self, device: UsbDevice) {
        let engine = BootEngine::new(Arc::clone(&self.transport), device.clone(), self.ctx.clone());
        let events = self.events.clone();

        tokio::spawn(async move {
            if let BootOutcome::Failed(source) = engine.run().await {
                let event = AdapterEvent::Error(AdapterError {
                    adapter: USBBOOT_ADAPTER_ID.to_string(),
                    device: device.raw_handle().to_string(),
                    source,
                });
                // No listener is fine, the failure was already logged
                let _ = events.send(event);
            }
        });
    }

    async fn record(&self, device: &UsbDevice) -> DriveRecord {
        let identity = device.descriptor.identity();
        let handle = device.raw_handle();
        let description = self
            .ctx
            .names
            .get(handle)
            .await
            .unwrap_or_else(|| GENERIC_DESCRIPTION.to_string());

        DriveRecord {
            id: handle.to_string(),
            adapter: USBBOOT_ADAPTER_ID.to_string(),
            display_name: DISPLAY_NAME.to_string(),
            description,
            size: None,
            disabled: true,
            icon: DriveIcon::Loading,
            progress: self.ctx.progress.get(handle).await,
            vendor_id: format_usb_id(identity.vendor_id),
            product_id: format_usb_id(identity.product_id),
        }
    }

    async fn scan_once(&self) -> Vec<DriveRecord> {
        let candidates = self.list_candidates().await;
        self.prune(&candidates).await;
        self.start_runs(&candidates).await;

        let mut records = Vec::with_capacity(candidates.len());
        for device in &candidates {
            records.push(self.record(device).await);
        }

        match self.snapshot.write() {
            Ok(mut snapshot) => *snapshot = records.clone(),
            Err(poisoned) => *poisoned.into_inner() = records.clone(),
        }
        let _ = self.events.send(AdapterEvent::Devices(records.clone()));
        records
    }
}

impl<T: UsbTransport> Adapter for UsbbootAdapter<T> {
    fn id(&self) -> &str {
        USBBOOT_ADAPTER_ID
    }

    fn scan(&self) -> BoxFuture<'_, Vec<DriveRecord>> {
        Box::pin(self.scan_once())
    }

    fn devices(&self) -> Vec<DriveRecord> {
        match self.snapshot.read() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

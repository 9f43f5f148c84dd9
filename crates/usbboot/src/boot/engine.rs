//! Boot engine
//!
//! One [`BootEngine`] drives one physical connection through the boot ROM
//! protocol. A device fresh out of the ROM gets `bootcode.bin` and reboots;
//! when it comes back (with a serial number and a new address) a second run
//! serves the files its second-stage loader asks for.
//!
//! ```text
//! Init ──serial index 0──▶ AwaitingBootcodeAck ──rc 0──▶ Done
//!   │                              └──rc != 0──▶ Failed
//!   └──serial index > 0──▶ ServingFiles(1) ──▶ ServingFiles(n) ──▶ Done
//! ```

use crate::boot::blobs::BlobCache;
use crate::boot::names::DeviceNames;
use crate::boot::progress::ProgressTable;
use crate::error::BootError;
use crate::usb::{DeviceLink, EndpointAddresses, RawDeviceHandle, UsbDevice, UsbTransport};
use bytes::Bytes;
use protocol::{
    FILE_REQUEST_SIZE, FileRequest, RETURN_CODE_SIZE, build_boot_message, check_return_code,
    parse_file_request, parse_return_code,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// First-stage loader sent to devices still in the boot ROM
pub const BOOTCODE_FILE_NAME: &str = "bootcode.bin";

/// Estimated number of requests a second-stage loader makes
///
/// Only used to scale the progress bar; a device asking for more simply
/// sits at the ceiling until it is done.
pub const FILE_SERVER_TOTAL_STEPS: u32 = 38;

/// Base of the file server progress scale, step 0
pub const FILE_SERVER_PROGRESS_FLOOR: u8 = 10;

/// Highest progress reported before the run completes
pub const FILE_SERVER_PROGRESS_CEILING: u8 = 95;

/// Progress once the bootcode is on the device, before its return code
pub const BOOTCODE_SENT_PROGRESS: u8 = 50;

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    Init,
    AwaitingBootcodeAck,
    ServingFiles { step: u32 },
    Done,
    Failed,
    Abandoned,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    /// The device got what it needed (or stopped asking)
    Done,
    /// The device vanished before the run could start
    Abandoned,
    /// Protocol or host fault; surfaced to the adapter's listeners
    Failed(BootError),
}

/// Delays of the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootTiming {
    /// Pause between a size announcement and its bulk payload
    pub request_delay: Duration,
    /// How long a finished run's progress stays readable
    pub settle_delay: Duration,
}

impl Default for BootTiming {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_millis(1000),
            settle_delay: Duration::from_millis(6000),
        }
    }
}

/// Shared state injected into every run
#[derive(Clone)]
pub struct BootContext {
    pub blobs: Arc<BlobCache>,
    pub progress: ProgressTable,
    pub names: DeviceNames,
    pub timing: BootTiming,
}

/// Map a file server step onto the progress bar
pub fn file_server_progress(step: u32) -> u8 {
    let span = u32::from(FILE_SERVER_PROGRESS_CEILING - FILE_SERVER_PROGRESS_FLOOR);
    let step = step.min(FILE_SERVER_TOTAL_STEPS);
    FILE_SERVER_PROGRESS_FLOOR + (step * span / FILE_SERVER_TOTAL_STEPS) as u8
}

/// Size of a file as carried by a size announcement
fn announced_size(name: &str, data: &[u8]) -> Result<u32, BootError> {
    u32::try_from(data.len()).map_err(|_| {
        BootError::Internal(format!("{} is too large to announce ({} bytes)", name, data.len()))
    })
}

/// Drives one connection through the protocol
///
/// The caller must own the connection's progress entry (see
/// [`ProgressTable::try_begin`]) before calling [`run`](Self::run).
pub struct BootEngine<T: UsbTransport> {
    transport: Arc<T>,
    device: UsbDevice,
    ctx: BootContext,
    stage: BootStage,
}

impl<T: UsbTransport> BootEngine<T> {
    pub fn new(transport: Arc<T>, device: UsbDevice, ctx: BootContext) -> Self {
        Self {
            transport,
            device,
            ctx,
            stage: BootStage::Init,
        }
    }

    pub fn stage(&self) -> BootStage {
        self.stage
    }

    fn handle(&self) -> RawDeviceHandle {
        self.device.raw_handle()
    }

    /// Run the protocol to completion and schedule the progress cleanup
    pub async fn run(mut self) -> BootOutcome {
        let handle = self.handle();
        let addresses = self.device.addresses();
        info!(
            device = %handle,
            identity = %self.device.descriptor.identity(),
            interface = addresses.interface,
            endpoint = addresses.endpoint,
            "Starting boot run"
        );

        let link = match self.connect(addresses).await {
            Ok(link) => link,
            Err(e) if e.is_benign() => {
                debug!(device = %handle, "Device went away before the run started: {}", e);
                self.stage = BootStage::Abandoned;
                return self.finish(BootOutcome::Abandoned).await;
            }
            Err(e) => {
                error!(device = %handle, "Failed to open device: {}", e);
                self.stage = BootStage::Failed;
                return self.finish(BootOutcome::Failed(e)).await;
            }
        };

        self.describe(&link).await;

        let result = if self.device.descriptor.needs_bootcode() {
            self.send_bootcode(&link, addresses.endpoint).await
        } else {
            self.serve_files(&link, addresses.endpoint).await
        };

        let outcome = match result {
            Ok(()) => BootOutcome::Done,
            Err(e) if e.is_benign() => {
                debug!(device = %handle, "Device went away mid-run: {}", e);
                BootOutcome::Done
            }
            Err(e) => {
                error!(device = %handle, stage = ?self.stage, "Boot run failed: {}", e);
                BootOutcome::Failed(e)
            }
        };
        self.stage = match outcome {
            BootOutcome::Failed(_) => BootStage::Failed,
            _ => BootStage::Done,
        };

        if let Err(e) = link.release_interface(addresses.interface).await {
            debug!(device = %handle, "Failed to release interface: {}", e);
        }
        // Last reference; closes the device
        drop(link);

        self.finish(outcome).await
    }

    async fn connect(
        &self,
        addresses: EndpointAddresses,
    ) -> Result<DeviceLink<T::Channel>, BootError> {
        let transport = Arc::clone(&self.transport);
        let device = self.device.clone();
        let channel = tokio::task::spawn_blocking(move || transport.open(&device))
            .await
            .map_err(|e| BootError::Internal(format!("open task failed: {}", e)))??;

        let link = DeviceLink::new(channel);
        link.claim_interface(addresses.interface).await?;
        Ok(link)
    }

    /// Remember the device's own description for the adapter's records
    async fn describe(&self, link: &DeviceLink<T::Channel>) {
        let handle = self.handle();
        match link.device_name().await {
            Ok(name) => {
                if let Some(description) = name.description() {
                    debug!(device = %handle, %description, "Device identified");
                    self.ctx.names.set(handle, description).await;
                }
            }
            Err(e) => debug!(device = %handle, "Could not read device strings: {}", e),
        }
    }

    async fn send_bootcode(
        &mut self,
        link: &DeviceLink<T::Channel>,
        endpoint: u8,
    ) -> Result<(), BootError> {
        self.stage = BootStage::AwaitingBootcodeAck;
        let handle = self.handle();
        let delay = self.ctx.timing.request_delay;

        let bootcode = self
            .ctx
            .blobs
            .get(BOOTCODE_FILE_NAME)
            .await
            .map_err(|e| BootError::Provider {
                name: BOOTCODE_FILE_NAME.to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| BootError::ResourceNotFound(BOOTCODE_FILE_NAME.to_string()))?;

        let length = announced_size(BOOTCODE_FILE_NAME, &bootcode)?;

        info!(device = %handle, size = length, "Sending bootcode");
        link.write(endpoint, build_boot_message(length), delay).await?;
        link.write(endpoint, bootcode, delay).await?;
        self.ctx.progress.set(handle, BOOTCODE_SENT_PROGRESS).await;

        // The ROM needs a moment before it reports back
        tokio::time::sleep(delay).await;
        let reply = link.read(RETURN_CODE_SIZE).await?;
        let code = parse_return_code(&reply)?;
        check_return_code(code)?;

        info!(device = %handle, "Bootcode accepted, device will re-enumerate");
        Ok(())
    }

    async fn serve_files(
        &mut self,
        link: &DeviceLink<T::Channel>,
        endpoint: u8,
    ) -> Result<(), BootError> {
        let handle = self.handle();
        let mut step = 1;
        self.stage = BootStage::ServingFiles { step };
        self.ctx.progress.set(handle, file_server_progress(step)).await;
        info!(device = %handle, "Serving files");

        loop {
            let buf = match link.read(FILE_REQUEST_SIZE).await {
                Ok(buf) => buf,
                Err(e) if e.ends_file_requests() => {
                    debug!(device = %handle, "{} while waiting for a request, assuming done", e);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match parse_file_request(&buf)? {
                FileRequest::Done => {
                    debug!(device = %handle, "Device reported done");
                    return Ok(());
                }
                FileRequest::GetFileSize(name) => {
                    let size = match self.lookup(&name).await {
                        Some(data) => announced_size(&name, &data)?,
                        None => 0,
                    };
                    debug!(device = %handle, file = %name, size, "Size request");
                    link.announce_size(size).await?;
                }
                FileRequest::ReadFile(name) => match self.lookup(&name).await {
                    Some(data) => {
                        debug!(device = %handle, file = %name, size = data.len(), "Read request");
                        link.write(endpoint, data, self.ctx.timing.request_delay)
                            .await?;
                    }
                    None => {
                        debug!(device = %handle, file = %name, "Read request for missing file");
                        link.announce_size(0).await?;
                    }
                },
            }

            step += 1;
            self.stage = BootStage::ServingFiles { step };
            self.ctx
                .progress
                .set(handle, file_server_progress(step))
                .await;
        }
    }

    /// Fetch a requested file; provider failures count as missing
    async fn lookup(&self, name: &str) -> Option<Bytes> {
        match self.ctx.blobs.get(name).await {
            Ok(found) => found,
            Err(e) => {
                warn!(device = %self.handle(), file = %name, "File provider failed: {}", e);
                None
            }
        }
    }

    async fn finish(self, outcome: BootOutcome) -> BootOutcome {
        let handle = self.handle();
        match &outcome {
            BootOutcome::Done | BootOutcome::Abandoned => {
                self.ctx.progress.set(handle, 100).await;
            }
            BootOutcome::Failed(_) => {}
        }
        self.ctx
            .progress
            .remove_after(handle, self.ctx.timing.settle_delay);
        info!(device = %handle, outcome = ?outcome, "Boot run finished");
        outcome
    }
}

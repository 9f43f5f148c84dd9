//! Test utilities for usbboot
//!
//! [`MockTransport`] stands in for libusb: devices are scripted with the
//! replies their control IN transfers return, and every operation a boot run
//! performs is recorded per connection so tests can assert on the exact
//! transfer sequence.
//!
//! # Example
//!
//! ```
//! use usbboot::test_utils::{MockDevice, MockTransport, mock_device, return_code};
//! use usbboot::usb::UsbTransport;
//!
//! let transport = MockTransport::new();
//! transport.add_device(MockDevice::new(mock_device(1, 4, 0x2763, 0, 1)).respond(return_code(0)));
//! assert_eq!(transport.list_devices().len(), 1);
//! ```

use crate::boot::BootTiming;
use crate::error::BootError;
use crate::usb::{
    DeviceDescriptor, DeviceName, RawDeviceHandle, UsbChannel, UsbDevice, UsbTransport,
};
use protocol::{FILE_REQUEST_SIZE, FileRequest, USB_VENDOR_ID_BROADCOM, encode_file_request};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One recorded transport operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Open,
    Claim(u8),
    Release(u8),
    ControlOut {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
    },
    ControlIn {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
    },
    BulkOut {
        endpoint: u8,
        len: usize,
    },
    Close,
}

/// A scripted device
#[derive(Debug, Clone)]
pub struct MockDevice {
    device: UsbDevice,
    responses: VecDeque<Result<Vec<u8>, BootError>>,
    open_error: Option<BootError>,
    claim_error: Option<BootError>,
    bulk_error: Option<BootError>,
    name: DeviceName,
}

impl MockDevice {
    pub fn new(device: UsbDevice) -> Self {
        Self {
            device,
            responses: VecDeque::new(),
            open_error: None,
            claim_error: None,
            bulk_error: None,
            name: DeviceName::default(),
        }
    }

    /// Manufacturer and product strings the device reports
    pub fn with_name(mut self, manufacturer: &str, product: &str) -> Self {
        self.name = DeviceName::new(manufacturer, product);
        self
    }

    /// Queue the data returned by the next control IN
    pub fn respond(mut self, data: Vec<u8>) -> Self {
        self.responses.push_back(Ok(data));
        self
    }

    /// Queue a failure for the next control IN
    pub fn respond_err(mut self, error: BootError) -> Self {
        self.responses.push_back(Err(error));
        self
    }

    pub fn fail_open(mut self, error: BootError) -> Self {
        self.open_error = Some(error);
        self
    }

    pub fn fail_claim(mut self, error: BootError) -> Self {
        self.claim_error = Some(error);
        self
    }

    pub fn fail_bulk(mut self, error: BootError) -> Self {
        self.bulk_error = Some(error);
        self
    }

    pub fn device(&self) -> &UsbDevice {
        &self.device
    }
}

#[derive(Default)]
struct MockState {
    devices: Vec<MockDevice>,
    ops: HashMap<RawDeviceHandle, Vec<MockOp>>,
    list_calls: usize,
}

impl MockState {
    fn record(&mut self, handle: RawDeviceHandle, op: MockOp) {
        self.ops.entry(handle).or_default().push(op);
    }

    fn script(&mut self, handle: RawDeviceHandle) -> Option<&mut MockDevice> {
        self.devices
            .iter_mut()
            .find(|d| d.device.raw_handle() == handle)
    }
}

/// In-memory transport, cheap to clone; clones share state
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        lock_state(&self.state)
    }

    /// Plug a device in
    pub fn add_device(&self, device: MockDevice) {
        self.lock().devices.push(device);
    }

    /// Replace every connected device
    pub fn set_devices(&self, devices: Vec<MockDevice>) {
        self.lock().devices = devices;
    }

    /// Unplug a device
    pub fn remove_device(&self, handle: RawDeviceHandle) {
        self.lock()
            .devices
            .retain(|d| d.device.raw_handle() != handle);
    }

    /// Operations recorded for a connection, in order
    pub fn ops(&self, handle: RawDeviceHandle) -> Vec<MockOp> {
        self.lock().ops.get(&handle).cloned().unwrap_or_default()
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    /// Number of times a connection was opened
    pub fn open_count(&self, handle: RawDeviceHandle) -> usize {
        self.ops(handle)
            .iter()
            .filter(|op| **op == MockOp::Open)
            .count()
    }
}

impl UsbTransport for MockTransport {
    type Channel = MockChannel;

    fn list_devices(&self) -> Vec<UsbDevice> {
        let mut state = self.lock();
        state.list_calls += 1;
        state.devices.iter().map(|d| d.device.clone()).collect()
    }

    fn open(&self, device: &UsbDevice) -> Result<MockChannel, BootError> {
        let handle = device.raw_handle();
        let mut state = self.lock();
        state.record(handle, MockOp::Open);

        let script = state.script(handle).ok_or(BootError::NoDevice)?;
        if let Some(error) = script.open_error.clone() {
            return Err(error);
        }

        Ok(MockChannel {
            state: Arc::clone(&self.state),
            handle,
        })
    }
}

/// Channel handed out by [`MockTransport`]
pub struct MockChannel {
    state: Arc<Mutex<MockState>>,
    handle: RawDeviceHandle,
}

impl UsbChannel for MockChannel {
    fn claim_interface(&mut self, interface: u8) -> Result<(), BootError> {
        let mut state = lock_state(&self.state);
        state.record(self.handle, MockOp::Claim(interface));
        match state.script(self.handle) {
            Some(script) => script.claim_error.clone().map_or(Ok(()), Err),
            None => Err(BootError::NoDevice),
        }
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), BootError> {
        lock_state(&self.state).record(self.handle, MockOp::Release(interface));
        Ok(())
    }

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        _data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, BootError> {
        lock_state(&self.state).record(
            self.handle,
            MockOp::ControlOut {
                request_type,
                request,
                value,
                index,
            },
        );
        Ok(0)
    }

    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, BootError> {
        let mut state = lock_state(&self.state);
        state.record(
            self.handle,
            MockOp::ControlIn {
                request_type,
                request,
                value,
                index,
                length: buf.len(),
            },
        );

        let script = state.script(self.handle).ok_or(BootError::NoDevice)?;
        // A device with nothing left to say stalls
        let reply = script
            .responses
            .pop_front()
            .unwrap_or(Err(BootError::TransferStalled))?;

        let n = reply.len().min(buf.len());
        buf[..n].copy_from_slice(&reply[..n]);
        Ok(n)
    }

    fn write_bulk(
        &mut self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, BootError> {
        let mut state = lock_state(&self.state);
        state.record(
            self.handle,
            MockOp::BulkOut {
                endpoint,
                len: data.len(),
            },
        );

        let script = state.script(self.handle).ok_or(BootError::NoDevice)?;
        match script.bulk_error.clone() {
            Some(error) => Err(error),
            None => Ok(data.len()),
        }
    }

    /// Not recorded; string reads are not part of the transfer sequence
    fn read_device_name(&mut self) -> Result<DeviceName, BootError> {
        let mut state = lock_state(&self.state);
        let script = state.script(self.handle).ok_or(BootError::NoDevice)?;
        Ok(script.name.clone())
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        lock_state(&self.state).record(self.handle, MockOp::Close);
    }
}

fn lock_state(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Create a Broadcom boot device
pub fn mock_device(
    bus_number: u8,
    device_address: u8,
    product_id: u16,
    serial_number_index: u8,
    interface_count: u8,
) -> UsbDevice {
    UsbDevice {
        bus_number,
        device_address,
        descriptor: DeviceDescriptor {
            vendor_id: USB_VENDOR_ID_BROADCOM,
            product_id,
            serial_number_index,
            interface_count,
        },
    }
}

/// Create a device outside the boot identity table
pub fn mock_foreign_device(bus_number: u8, device_address: u8) -> UsbDevice {
    UsbDevice {
        bus_number,
        device_address,
        descriptor: DeviceDescriptor {
            vendor_id: 0x1234,
            product_id: 0x5678,
            serial_number_index: 3,
            interface_count: 1,
        },
    }
}

/// Encode a file request the way a second-stage loader sends it
pub fn file_request(request: &FileRequest) -> Vec<u8> {
    match encode_file_request(request) {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => panic!("invalid test file request {:?}: {}", request, e),
    }
}

/// Build a file request with an arbitrary command code
pub fn raw_file_request(code: i32, name: &str) -> Vec<u8> {
    let mut buf = vec![0u8; FILE_REQUEST_SIZE];
    buf[..4].copy_from_slice(&code.to_le_bytes());
    buf[4..4 + name.len()].copy_from_slice(name.as_bytes());
    buf
}

/// Bootcode return code as read back from the device
pub fn return_code(code: i32) -> Vec<u8> {
    code.to_le_bytes().to_vec()
}

/// Protocol delays short enough for tests
pub fn fast_timing() -> BootTiming {
    BootTiming {
        request_delay: Duration::from_millis(1),
        settle_delay: Duration::from_millis(300),
    }
}

/// Run an async operation with a timeout
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Poll `condition` every 5 ms until it holds or `duration` passes
pub async fn wait_until<F, Fut>(duration: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

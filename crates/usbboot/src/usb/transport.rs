//! USB transport
//!
//! [`UsbTransport`] enumerates devices and opens them, [`UsbChannel`] is an
//! opened device. Both are synchronous, like libusb itself; callers move the
//! calls onto the blocking pool (see [`crate::usb::transfers`]).
//!
//! [`RusbTransport`] is the libusb-backed implementation. If libusb cannot
//! be initialised (no USB controller, sandboxed CI) it reports no devices
//! instead of failing.

use crate::error::BootError;
use crate::usb::device::{DeviceDescriptor, DeviceName, UsbDevice};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::{debug, warn};

/// Device enumeration and opening
pub trait UsbTransport: Send + Sync + 'static {
    type Channel: UsbChannel;

    /// List connected devices; never fails, empty when USB is unavailable
    fn list_devices(&self) -> Vec<UsbDevice>;

    /// Open a device found by a previous [`list_devices`](Self::list_devices)
    fn open(&self, device: &UsbDevice) -> Result<Self::Channel, BootError>;
}

/// Transfers on an opened device
///
/// Dropping the channel closes the device.
pub trait UsbChannel: Send + 'static {
    fn claim_interface(&mut self, interface: u8) -> Result<(), BootError>;

    fn release_interface(&mut self, interface: u8) -> Result<(), BootError>;

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, BootError>;

    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, BootError>;

    /// A zero `timeout` waits forever
    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration)
    -> Result<usize, BootError>;

    /// Read the manufacturer and product strings
    ///
    /// A string the device does not provide is `None`, not an error.
    fn read_device_name(&mut self) -> Result<DeviceName, BootError>;
}

/// libusb-backed transport
pub struct RusbTransport {
    /// `None` when libusb could not be initialised on this host
    context: Option<Context>,
}

impl RusbTransport {
    pub fn new() -> Self {
        match Context::new() {
            Ok(context) => Self {
                context: Some(context),
            },
            Err(e) => {
                warn!("USB is unavailable on this host, no devices will be found: {}", e);
                Self { context: None }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.context.is_some()
    }

    fn find_device(&self, target: &UsbDevice) -> Result<Device<Context>, BootError> {
        let context = self.context.as_ref().ok_or(BootError::NoDevice)?;
        let devices = context.devices()?;

        devices
            .iter()
            .find(|d| d.bus_number() == target.bus_number && d.address() == target.device_address)
            .ok_or(BootError::NoDevice)
    }
}

impl Default for RusbTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for RusbTransport {
    type Channel = RusbChannel;

    fn list_devices(&self) -> Vec<UsbDevice> {
        let Some(context) = self.context.as_ref() else {
            return Vec::new();
        };

        let devices = match context.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to enumerate USB devices: {}", e);
                return Vec::new();
            }
        };

        devices.iter().filter_map(|d| describe_device(&d)).collect()
    }

    fn open(&self, device: &UsbDevice) -> Result<RusbChannel, BootError> {
        let found = self.find_device(device)?;
        let handle = found.open()?;
        debug!("Opened device {}", device.raw_handle());

        Ok(RusbChannel {
            handle,
            detached: Vec::new(),
        })
    }
}

/// Build the owned description of an enumerated device
fn describe_device(device: &Device<Context>) -> Option<UsbDevice> {
    let descriptor = match device.device_descriptor() {
        Ok(descriptor) => descriptor,
        Err(e) => {
            debug!(
                "Skipping device bus={} addr={}: {}",
                device.bus_number(),
                device.address(),
                e
            );
            return None;
        }
    };

    let interface_count = device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))
        .map(|config| config.num_interfaces())
        .unwrap_or_else(|e| {
            debug!(
                "No configuration descriptor for bus={} addr={}: {}",
                device.bus_number(),
                device.address(),
                e
            );
            1
        });

    Some(UsbDevice {
        bus_number: device.bus_number(),
        device_address: device.address(),
        descriptor: DeviceDescriptor {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            serial_number_index: descriptor.serial_number_string_index().unwrap_or(0),
            interface_count,
        },
    })
}

/// An opened libusb device
pub struct RusbChannel {
    handle: DeviceHandle<Context>,
    /// Interfaces we took away from a kernel driver
    detached: Vec<u8>,
}

impl UsbChannel for RusbChannel {
    fn claim_interface(&mut self, interface: u8) -> Result<(), BootError> {
        // On the dual-interface variant the kernel may have bound mass storage
        match self.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match self.handle.detach_kernel_driver(interface) {
                    Ok(()) => self.detached.push(interface),
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        self.handle.claim_interface(interface)?;
        debug!("Claimed interface {}", interface);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), BootError> {
        self.handle.release_interface(interface)?;
        debug!("Released interface {}", interface);

        if let Some(pos) = self.detached.iter().position(|&i| i == interface) {
            self.detached.remove(pos);
            if let Err(e) = self.handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }
        Ok(())
    }

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, BootError> {
        Ok(self
            .handle
            .write_control(request_type, request, value, index, data, timeout)?)
    }

    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, BootError> {
        Ok(self
            .handle
            .read_control(request_type, request, value, index, buf, timeout)?)
    }

    fn write_bulk(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, BootError> {
        Ok(self.handle.write_bulk(endpoint, data, timeout)?)
    }

    fn read_device_name(&mut self) -> Result<DeviceName, BootError> {
        let descriptor = self.handle.device().device_descriptor()?;

        let manufacturer = match self.handle.read_manufacturer_string_ascii(&descriptor) {
            Ok(s) => Some(s),
            Err(e) => {
                debug!("No manufacturer string: {}", e);
                None
            }
        };
        let product = match self.handle.read_product_string_ascii(&descriptor) {
            Ok(s) => Some(s),
            Err(e) => {
                debug!("No product string: {}", e);
                None
            }
        };

        Ok(DeviceName {
            manufacturer,
            product,
        })
    }
}

//! USB device value types
//!
//! A [`UsbDevice`] is an owned snapshot of what enumeration told us about one
//! physical connection. Nothing here holds a libusb handle.

use protocol::DeviceIdentity;
use std::fmt;

/// The number of USB interfaces on a BCM2835 boot ROM
const USB_ENDPOINT_INTERFACES_SOC_BCM2835: u8 = 1;

/// The descriptor index of an empty string property
const USB_DESCRIPTOR_NULL_INDEX: u8 = 0;

/// Bus position of a device for the lifetime of one connection
///
/// A device that reboots comes back with a new address, hence a new handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawDeviceHandle {
    pub bus_number: u8,
    pub device_address: u8,
}

impl RawDeviceHandle {
    pub fn new(bus_number: u8, device_address: u8) -> Self {
        Self {
            bus_number,
            device_address,
        }
    }
}

impl fmt::Display for RawDeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus_number, self.device_address)
    }
}

/// The subset of the device and configuration descriptors the boot protocol needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// `iSerialNumber`; zero until the device runs the second-stage loader
    pub serial_number_index: u8,
    /// `bNumInterfaces` of the active configuration
    pub interface_count: u8,
}

impl DeviceDescriptor {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.vendor_id, self.product_id)
    }

    /// Devices fresh out of the boot ROM report no serial number string
    pub fn needs_bootcode(&self) -> bool {
        self.serial_number_index == USB_DESCRIPTOR_NULL_INDEX
    }
}

/// Interface and bulk OUT endpoint used to talk to the boot ROM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointAddresses {
    pub interface: u8,
    pub endpoint: u8,
}

/// The strings a device reports about itself
///
/// Read from the `iManufacturer` and `iProduct` descriptors once the device
/// is open; either may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceName {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl DeviceName {
    pub fn new(manufacturer: impl Into<String>, product: impl Into<String>) -> Self {
        Self {
            manufacturer: Some(manufacturer.into()),
            product: Some(product.into()),
        }
    }

    /// `"<manufacturer> <product>"`, `None` if the device named neither
    pub fn description(&self) -> Option<String> {
        let parts: Vec<&str> = [self.manufacturer.as_deref(), self.product.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// A USB device as seen by one enumeration pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    pub bus_number: u8,
    pub device_address: u8,
    pub descriptor: DeviceDescriptor,
}

impl UsbDevice {
    pub fn raw_handle(&self) -> RawDeviceHandle {
        RawDeviceHandle::new(self.bus_number, self.device_address)
    }

    /// Pick the vendor interface and its bulk OUT endpoint
    ///
    /// A BCM2837 can enumerate with two interfaces: the first is mass storage
    /// and the second is the vendor interface used for programming.
    pub fn addresses(&self) -> EndpointAddresses {
        if self.descriptor.interface_count == USB_ENDPOINT_INTERFACES_SOC_BCM2835 {
            EndpointAddresses {
                interface: 0,
                endpoint: 1,
            }
        } else {
            EndpointAddresses {
                interface: 1,
                endpoint: 3,
            }
        }
    }
}

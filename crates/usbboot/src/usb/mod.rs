//! USB subsystem
//!
//! Device enumeration, the transport abstraction and the boot ROM transfer
//! primitives. libusb is synchronous, so every call made on behalf of the
//! async side goes through the Tokio blocking pool.

pub mod device;
pub mod transfers;
pub mod transport;

pub use device::{DeviceDescriptor, DeviceName, EndpointAddresses, RawDeviceHandle, UsbDevice};
pub use transfers::DeviceLink;
pub use transport::{RusbChannel, RusbTransport, UsbChannel, UsbTransport};

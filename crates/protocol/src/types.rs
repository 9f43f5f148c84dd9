//! Message and identity types for the usbboot protocol
//!
//! The boot ROM of BCM2835/BCM2837 parts enumerates with one of a small set of
//! vendor/product pairs and drives the conversation: the host answers the
//! requests the device makes, it never initiates a file transfer on its own.

use std::fmt;

/// Vendor ID of "Broadcom Corporation"
pub const USB_VENDOR_ID_BROADCOM: u16 = 0x0a5c;

/// Product ID of the BCM2708 (BCM2835) boot ROM
pub const USB_PRODUCT_ID_BCM2708_BOOT: u16 = 0x2763;

/// Product ID of the BCM2710 (BCM2837) boot ROM
pub const USB_PRODUCT_ID_BCM2710_BOOT: u16 = 0x2764;

/// A vendor/product pair that speaks the usbboot protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentity {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Boot-capable devices known to this protocol version
///
/// Supporting a new part means appending its pair here.
pub const USBBOOT_CAPABLE_DEVICES: &[DeviceIdentity] = &[
    // BCM2835
    DeviceIdentity::new(USB_VENDOR_ID_BROADCOM, USB_PRODUCT_ID_BCM2708_BOOT),
    // BCM2837
    DeviceIdentity::new(USB_VENDOR_ID_BROADCOM, USB_PRODUCT_ID_BCM2710_BOOT),
];

/// Raw command codes of a file request
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCommand {
    GetFileSize = 0,
    ReadFile = 1,
    Done = 2,
}

impl TryFrom<i32> for FileCommand {
    type Error = crate::ProtocolError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::GetFileSize),
            1 => Ok(Self::ReadFile),
            2 => Ok(Self::Done),
            other => Err(crate::ProtocolError::UnknownCommand(other)),
        }
    }
}

/// A decoded request from a device in the file-server stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRequest {
    /// Announce the size of the named file (0 if missing)
    GetFileSize(String),
    /// Send the contents of the named file
    ReadFile(String),
    /// The device has everything it needs
    Done,
}

impl FileRequest {
    pub fn command(&self) -> FileCommand {
        match self {
            Self::GetFileSize(_) => FileCommand::GetFileSize,
            Self::ReadFile(_) => FileCommand::ReadFile,
            Self::Done => FileCommand::Done,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::GetFileSize(name) | Self::ReadFile(name) => Some(name),
            Self::Done => None,
        }
    }
}

/// `wValue`/`wIndex` pair carrying a 32-bit size in a control setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeFields {
    pub value: u16,
    pub index: u16,
}

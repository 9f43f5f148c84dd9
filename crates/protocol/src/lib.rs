//! Protocol library for usbboot
//!
//! This crate defines the wire format spoken by the boot ROM of Raspberry Pi
//! compute modules when they enumerate over USB without boot media. It is pure:
//! nothing here touches a device, it only builds and parses buffers.
//!
//! # Example
//!
//! ```
//! use protocol::{FileRequest, encode_file_request, parse_file_request};
//!
//! let request = FileRequest::GetFileSize("start.elf".to_string());
//! let bytes = encode_file_request(&request).unwrap();
//! assert_eq!(bytes.len(), protocol::FILE_REQUEST_SIZE);
//!
//! let decoded = parse_file_request(&bytes).unwrap();
//! assert_eq!(decoded, request);
//! ```

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{
    BOOT_MESSAGE_SIZE, FILE_NAME_SIZE, FILE_REQUEST_SIZE, RETURN_CODE_SIZE, RETURN_CODE_SUCCESS,
    build_boot_message, check_return_code, encode_file_request, parse_file_request,
    parse_return_code, split_size_for_control_fields,
};
pub use error::{ProtocolError, Result};
pub use types::{
    DeviceIdentity, FileCommand, FileRequest, SizeFields, USB_PRODUCT_ID_BCM2708_BOOT,
    USB_PRODUCT_ID_BCM2710_BOOT, USB_VENDOR_ID_BROADCOM, USBBOOT_CAPABLE_DEVICES,
};

//! Boot run error types
//!
//! Every failure a boot run can meet ends up in [`BootError`]. The engine and
//! the adapter decide what to do with it by matching on the variant, never on
//! the message text.

use protocol::ProtocolError;
use thiserror::Error;

/// Errors raised while bootstrapping a device
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootError {
    /// The device went away (unplugged, or re-enumerated after a reboot)
    #[error("Device is no longer connected")]
    NoDevice,

    /// The transfer was cancelled before it completed
    #[error("Transfer cancelled")]
    TransferCancelled,

    /// The endpoint stalled
    #[error("Transfer stalled")]
    TransferStalled,

    /// Generic transfer failure reported by the host controller
    #[error("Transfer failed with an I/O error")]
    TransferFailed,

    /// The control transfer timeout elapsed
    #[error("Transfer timed out")]
    Timeout,

    /// The device sent something the protocol does not allow
    #[error("Protocol fault: {0}")]
    ProtocolFault(#[from] ProtocolError),

    /// A file the run cannot do without is missing from the provider
    #[error("File not found: {0}")]
    ResourceNotFound(String),

    /// The file provider failed for a reason other than "not found"
    #[error("Failed to read {name}: {reason}")]
    Provider { name: String, reason: String },

    /// Any other libusb failure
    #[error("USB error: {0}")]
    Usb(String),

    /// Host-side failure unrelated to the device
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BootError {
    /// Whether the error means the device simply disappeared
    ///
    /// Benign errors end a run silently, everything else is reported.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::NoDevice | Self::TransferCancelled)
    }

    /// Whether the error, seen while waiting for the next file request,
    /// means the device has nothing more to ask for
    pub fn ends_file_requests(&self) -> bool {
        matches!(self, Self::TransferStalled | Self::TransferFailed)
    }
}

impl From<rusb::Error> for BootError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::NoDevice => Self::NoDevice,
            rusb::Error::Interrupted => Self::TransferCancelled,
            rusb::Error::Pipe => Self::TransferStalled,
            rusb::Error::Io => Self::TransferFailed,
            rusb::Error::Timeout => Self::Timeout,
            _ => Self::Usb(err.to_string()),
        }
    }
}

//! Protocol error types

use thiserror::Error;

/// Decode and encode faults for the usbboot wire messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Command code outside {GetFileSize, ReadFile, Done}
    #[error("Unrecognized file command: {0}")]
    UnknownCommand(i32),

    /// Device rejected the uploaded bootcode
    #[error("Bootcode rejected, device returned code {0}")]
    BadReturnCode(i32),

    /// Buffer is not the size the message requires
    #[error("Invalid message length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// File name does not fit in the 256-byte name field
    #[error("File name too long: {len} bytes (max: {max})")]
    FileNameTooLong { len: usize, max: usize },

    /// File names travel as plain ASCII
    #[error("File name is not ASCII: {0:?}")]
    NonAsciiFileName(String),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

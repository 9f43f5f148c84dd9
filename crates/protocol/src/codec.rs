//! Encoding and decoding of the usbboot wire messages
//!
//! Only two structured messages cross the wire. Everything else is raw file
//! content or a size carried in the setup packet of a control transfer.
//!
//! # Boot message (host → device, bulk)
//! ```text
//! [Bootcode length: u32 (big-endian)][Signature: 20 bytes, zeroed]
//! ```
//!
//! # File request (device → host, control IN)
//! ```text
//! [Command: i32 (little-endian)][File name: 256 bytes, ASCII, NUL padded]
//! ```

use crate::error::{ProtocolError, Result};
use crate::types::{FileCommand, FileRequest, SizeFields};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the bootcode length field of a boot message
const BOOT_MESSAGE_LENGTH_SIZE: usize = 4;

/// Size of the (unused) signature field of a boot message
const BOOT_MESSAGE_SIGNATURE_SIZE: usize = 20;

/// Total size of a boot message
pub const BOOT_MESSAGE_SIZE: usize = BOOT_MESSAGE_LENGTH_SIZE + BOOT_MESSAGE_SIGNATURE_SIZE;

/// Size of the command field of a file request
const FILE_COMMAND_SIZE: usize = 4;

/// Size of the file name field of a file request
pub const FILE_NAME_SIZE: usize = 256;

/// Total size of a file request
pub const FILE_REQUEST_SIZE: usize = FILE_COMMAND_SIZE + FILE_NAME_SIZE;

/// Size of the return code read back after the bootcode upload
pub const RETURN_CODE_SIZE: usize = 4;

/// Return code reported by a device that accepted its bootcode
pub const RETURN_CODE_SUCCESS: i32 = 0;

/// Build the boot message announcing a bootcode upload of `bootcode_len` bytes
///
/// # Example
/// ```
/// use protocol::build_boot_message;
///
/// let msg = build_boot_message(50216);
/// assert_eq!(msg.len(), 24);
/// assert_eq!(&msg[..4], &50216u32.to_be_bytes());
/// ```
pub fn build_boot_message(bootcode_len: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(BOOT_MESSAGE_SIZE);
    buf.put_u32(bootcode_len);
    buf.put_bytes(0, BOOT_MESSAGE_SIGNATURE_SIZE);
    buf.freeze()
}

/// Decode a file request read from the device
///
/// An empty file name means the device is finished, whatever the command
/// code says. An unknown command code with a non-empty name is a fault.
///
/// # Example
/// ```
/// use protocol::{FileRequest, FILE_REQUEST_SIZE, parse_file_request};
///
/// let buf = [0u8; FILE_REQUEST_SIZE];
/// assert_eq!(parse_file_request(&buf).unwrap(), FileRequest::Done);
/// ```
pub fn parse_file_request(buf: &[u8]) -> Result<FileRequest> {
    if buf.len() != FILE_REQUEST_SIZE {
        return Err(ProtocolError::InvalidLength {
            expected: FILE_REQUEST_SIZE,
            actual: buf.len(),
        });
    }

    let code = LittleEndian::read_i32(&buf[..FILE_COMMAND_SIZE]);
    let name_field = &buf[FILE_COMMAND_SIZE..];
    let name_len = name_field
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(name_field.len());
    let name = &name_field[..name_len];

    if name.is_empty() {
        return Ok(FileRequest::Done);
    }

    let command = FileCommand::try_from(code)?;
    if !name.is_ascii() {
        return Err(ProtocolError::NonAsciiFileName(
            String::from_utf8_lossy(name).into_owned(),
        ));
    }
    // ASCII was checked above
    let name = String::from_utf8_lossy(name).into_owned();

    Ok(match command {
        FileCommand::GetFileSize => FileRequest::GetFileSize(name),
        FileCommand::ReadFile => FileRequest::ReadFile(name),
        FileCommand::Done => FileRequest::Done,
    })
}

/// Encode a file request the way a device would send it
///
/// The name must leave room for at least one terminating NUL.
pub fn encode_file_request(request: &FileRequest) -> Result<Bytes> {
    let name = request.file_name().unwrap_or("");
    if name.len() >= FILE_NAME_SIZE {
        return Err(ProtocolError::FileNameTooLong {
            len: name.len(),
            max: FILE_NAME_SIZE - 1,
        });
    }
    if !name.is_ascii() {
        return Err(ProtocolError::NonAsciiFileName(name.to_string()));
    }

    let mut buf = BytesMut::with_capacity(FILE_REQUEST_SIZE);
    buf.put_i32_le(request.command() as i32);
    buf.put_slice(name.as_bytes());
    buf.put_bytes(0, FILE_NAME_SIZE - name.len());
    Ok(buf.freeze())
}

/// Split a 32-bit size into the `wValue`/`wIndex` fields of a setup packet
pub fn split_size_for_control_fields(size: u32) -> SizeFields {
    SizeFields {
        value: (size & 0xffff) as u16,
        index: (size >> 16) as u16,
    }
}

/// Decode the 4-byte return code read after a bootcode upload
pub fn parse_return_code(buf: &[u8]) -> Result<i32> {
    if buf.len() < RETURN_CODE_SIZE {
        return Err(ProtocolError::InvalidLength {
            expected: RETURN_CODE_SIZE,
            actual: buf.len(),
        });
    }
    Ok(LittleEndian::read_i32(&buf[..RETURN_CODE_SIZE]))
}

/// Turn a non-success return code into a fault
pub fn check_return_code(code: i32) -> Result<()> {
    if code == RETURN_CODE_SUCCESS {
        Ok(())
    } else {
        Err(ProtocolError::BadReturnCode(code))
    }
}

//! Boot ROM transfer primitives
//!
//! The boot ROM speaks a small dialect on top of vendor control transfers:
//! every payload is preceded by a control OUT carrying its size in the setup
//! packet, and every device-to-host message is a control IN whose setup
//! packet carries the expected length. [`DeviceLink`] implements those
//! primitives over any [`UsbChannel`], moving each blocking libusb call onto
//! the Tokio blocking pool.

use crate::error::BootError;
use crate::usb::device::DeviceName;
use crate::usb::transport::UsbChannel;
use bytes::Bytes;
use protocol::split_size_for_control_fields;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

/// bmRequestType of host-to-device vendor requests
pub const LIBUSB_REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;

/// bmRequestType of device-to-host vendor requests
pub const LIBUSB_REQUEST_TYPE_VENDOR_IN: u8 = 0xc0;

/// bRequest used for every boot ROM control transfer (GET_STATUS)
pub const LIBUSB_REQUEST_GET_STATUS: u8 = 0x00;

/// Timeout of the size announcement and of control reads
pub const CONTROL_TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);

/// Bulk transfers wait as long as the device needs
pub const BULK_TRANSFER_TIMEOUT: Duration = Duration::ZERO;

/// An opened, shareable device channel
pub struct DeviceLink<C: UsbChannel> {
    channel: Arc<Mutex<C>>,
}

impl<C: UsbChannel> Clone for DeviceLink<C> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
        }
    }
}

impl<C: UsbChannel> DeviceLink<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
        }
    }

    /// Run a closure against the channel on the blocking pool
    async fn blocking<R, F>(&self, f: F) -> Result<R, BootError>
    where
        R: Send + 'static,
        F: FnOnce(&mut C) -> Result<R, BootError> + Send + 'static,
    {
        let channel = Arc::clone(&self.channel);
        tokio::task::spawn_blocking(move || {
            let mut guard = channel
                .lock()
                .map_err(|_| BootError::Internal("device channel lock poisoned".into()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| BootError::Internal(format!("transfer task failed: {}", e)))?
    }

    pub async fn claim_interface(&self, interface: u8) -> Result<(), BootError> {
        self.blocking(move |c| c.claim_interface(interface)).await
    }

    pub async fn release_interface(&self, interface: u8) -> Result<(), BootError> {
        self.blocking(move |c| c.release_interface(interface)).await
    }

    pub async fn device_name(&self) -> Result<DeviceName, BootError> {
        self.blocking(|c| c.read_device_name()).await
    }

    /// Tell the device how many bytes follow, or answer a size query
    pub async fn announce_size(&self, size: u32) -> Result<(), BootError> {
        let fields = split_size_for_control_fields(size);
        trace!(size, value = fields.value, index = fields.index, "Announcing size");

        self.blocking(move |c| {
            c.write_control(
                LIBUSB_REQUEST_TYPE_VENDOR_OUT,
                LIBUSB_REQUEST_GET_STATUS,
                fields.value,
                fields.index,
                &[],
                CONTROL_TRANSFER_TIMEOUT,
            )
        })
        .await
        .map(|_| ())
    }

    /// Read a `length`-byte message from the device
    pub async fn read(&self, length: usize) -> Result<Vec<u8>, BootError> {
        let fields = split_size_for_control_fields(length as u32);

        self.blocking(move |c| {
            let mut buf = vec![0u8; length];
            let read = c.read_control(
                LIBUSB_REQUEST_TYPE_VENDOR_IN,
                LIBUSB_REQUEST_GET_STATUS,
                fields.value,
                fields.index,
                &mut buf,
                CONTROL_TRANSFER_TIMEOUT,
            )?;
            buf.truncate(read);
            Ok(buf)
        })
        .await
    }

    /// Push `data` on a bulk OUT endpoint until every byte is accepted
    pub async fn bulk_write(&self, endpoint: u8, data: Bytes) -> Result<(), BootError> {
        self.blocking(move |c| {
            let mut offset = 0;
            while offset < data.len() {
                let written = c.write_bulk(endpoint, &data[offset..], BULK_TRANSFER_TIMEOUT)?;
                if written == 0 {
                    return Err(BootError::TransferFailed);
                }
                offset += written;
            }
            Ok(())
        })
        .await
    }

    /// Announce `data`, give the device `delay` to get ready, then send it
    ///
    /// An empty payload is only announced.
    pub async fn write(&self, endpoint: u8, data: Bytes, delay: Duration) -> Result<(), BootError> {
        let size = u32::try_from(data.len()).map_err(|_| {
            BootError::Internal(format!("payload of {} bytes is too large", data.len()))
        })?;

        self.announce_size(size).await?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if data.is_empty() {
            return Ok(());
        }

        debug!(endpoint, size, "Bulk write");
        self.bulk_write(endpoint, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Channel that accepts at most `chunk` bytes per bulk call
    struct ChunkedChannel {
        chunk: usize,
        control: Vec<(u8, u16, u16)>,
        bulk: Vec<usize>,
    }

    impl UsbChannel for ChunkedChannel {
        fn claim_interface(&mut self, _interface: u8) -> Result<(), BootError> {
            Ok(())
        }

        fn release_interface(&mut self, _interface: u8) -> Result<(), BootError> {
            Ok(())
        }

        fn write_control(
            &mut self,
            request_type: u8,
            _request: u8,
            value: u16,
            index: u16,
            _data: &[u8],
            _timeout: Duration,
        ) -> Result<usize, BootError> {
            self.control.push((request_type, value, index));
            Ok(0)
        }

        fn read_control(
            &mut self,
            request_type: u8,
            _request: u8,
            value: u16,
            index: u16,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize, BootError> {
            self.control.push((request_type, value, index));
            buf.fill(0xaa);
            Ok(buf.len())
        }

        fn write_bulk(
            &mut self,
            _endpoint: u8,
            data: &[u8],
            _timeout: Duration,
        ) -> Result<usize, BootError> {
            let n = data.len().min(self.chunk);
            self.bulk.push(n);
            Ok(n)
        }

        fn read_device_name(&mut self) -> Result<DeviceName, BootError> {
            Ok(DeviceName::default())
        }
    }

    fn link(chunk: usize) -> DeviceLink<ChunkedChannel> {
        DeviceLink::new(ChunkedChannel {
            chunk,
            control: Vec::new(),
            bulk: Vec::new(),
        })
    }

    #[tokio::test]
    async fn test_announce_splits_size() {
        let link = link(64);
        link.announce_size(0x0002_0010).await.unwrap();

        let channel = link.channel.lock().unwrap();
        assert_eq!(
            channel.control,
            vec![(LIBUSB_REQUEST_TYPE_VENDOR_OUT, 0x0010, 0x0002)]
        );
    }

    #[tokio::test]
    async fn test_bulk_write_loops_over_short_writes() {
        let link = link(100);
        link.write(1, Bytes::from(vec![7u8; 250]), Duration::ZERO)
            .await
            .unwrap();

        let channel = link.channel.lock().unwrap();
        assert_eq!(channel.bulk, vec![100, 100, 50]);
        assert_eq!(channel.control.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_write_is_announce_only() {
        let link = link(100);
        link.write(1, Bytes::new(), Duration::ZERO).await.unwrap();

        let channel = link.channel.lock().unwrap();
        assert_eq!(channel.control, vec![(LIBUSB_REQUEST_TYPE_VENDOR_OUT, 0, 0)]);
        assert!(channel.bulk.is_empty());
    }

    #[tokio::test]
    async fn test_read_uses_vendor_in() {
        let link = link(100);
        let data = link.read(4).await.unwrap();
        assert_eq!(data, vec![0xaa; 4]);

        let channel = link.channel.lock().unwrap();
        assert_eq!(channel.control, vec![(LIBUSB_REQUEST_TYPE_VENDOR_IN, 4, 0)]);
    }

    #[tokio::test]
    async fn test_zero_length_bulk_is_failure() {
        let link = link(0);
        let err = link.bulk_write(1, Bytes::from_static(b"abc")).await.unwrap_err();
        assert_eq!(err, BootError::TransferFailed);
    }
}

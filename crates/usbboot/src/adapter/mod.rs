//! Device adapters
//!
//! An adapter turns one family of hardware into drive records the scanner
//! can aggregate. The only adapter shipped here is [`UsbbootAdapter`].

pub mod usbboot;

pub use usbboot::{UsbbootAdapter, UsbbootOptions};

use crate::error::BootError;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::broadcast;

/// Boxed future returned by object-safe adapter methods
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Icon hint for the drive list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveIcon {
    Loading,
}

/// One entry of a devices snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveRecord {
    pub id: String,
    pub adapter: String,
    pub display_name: String,
    pub description: String,
    /// Unknown until the device exposes its storage
    pub size: Option<u64>,
    pub disabled: bool,
    pub icon: DriveIcon,
    /// Percentage of the current boot run, if one is in flight
    pub progress: Option<u8>,
    pub vendor_id: String,
    pub product_id: String,
}

/// A fault raised by one device, reported without stopping the adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{adapter} adapter, device {device}: {source}")]
pub struct AdapterError {
    pub adapter: String,
    pub device: String,
    #[source]
    pub source: BootError,
}

/// Notifications published by an adapter
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// The snapshot produced by the latest scan
    Devices(Vec<DriveRecord>),
    Error(AdapterError),
}

/// A source of drive records
pub trait Adapter: Send + Sync + 'static {
    /// Stable identifier, unique per scanner
    fn id(&self) -> &str;

    /// Enumerate, start work on new devices and return the fresh snapshot
    ///
    /// Never fails; per-device faults are published as events.
    fn scan(&self) -> BoxFuture<'_, Vec<DriveRecord>>;

    /// The snapshot of the latest scan
    fn devices(&self) -> Vec<DriveRecord>;

    fn events(&self) -> broadcast::Receiver<AdapterEvent>;
}

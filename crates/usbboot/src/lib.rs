//! usbboot
//!
//! Bootstraps Raspberry Pi Compute Modules over USB. A module without boot
//! media enumerates as a Broadcom boot ROM device; this crate finds such
//! devices, uploads `bootcode.bin`, then serves the files the second-stage
//! loader asks for until the module exposes its eMMC as mass storage.
//!
//! The pieces, bottom-up:
//! - [`usb`]: enumeration, the transport traits and the boot ROM transfers
//! - [`boot`]: file providers, the blob cache, progress and the boot engine
//! - [`adapter`]: turns boot ROM devices into drive records
//! - [`scanner`]: polls adapters and aggregates their events
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use usbboot::adapter::{UsbbootAdapter, UsbbootOptions};
//! use usbboot::boot::DirectoryProvider;
//! use usbboot::scanner::Scanner;
//! use usbboot::usb::RusbTransport;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let adapter = UsbbootAdapter::new(
//!     Arc::new(RusbTransport::new()),
//!     Arc::new(DirectoryProvider::new("/usr/share/rpiboot/msd")),
//!     UsbbootOptions::default(),
//! );
//!
//! let mut scanner = Scanner::new();
//! scanner.subscribe(Arc::new(adapter))?;
//! let events = scanner.events();
//! scanner.start();
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod boot;
pub mod config;
pub mod error;
pub mod scanner;
pub mod service;
pub mod test_utils;
pub mod usb;

pub use adapter::{Adapter, AdapterError, AdapterEvent, DriveRecord, UsbbootAdapter, UsbbootOptions};
pub use boot::{BootOutcome, BootTiming, DirectoryProvider, FileProvider, MemoryProvider};
pub use config::UsbbootConfig;
pub use error::BootError;
pub use scanner::{Scanner, ScannerError, ScannerEvent};

//! Common utilities for usbboot
//!
//! This crate provides shared functionality for the usbboot workspace:
//! error handling, logging setup and USB id formatting helpers.

pub mod error;
pub mod logging;
pub mod usb_types;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{format_usb_id, parse_identity_pair, parse_usb_id};

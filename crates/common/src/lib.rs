//! Common utilities for usbipd-rs
//!
//! This crate provides functionality shared by the daemon and the privileged
//! helper: error handling, logging setup, and the async channel bridge
//! between the Tokio runtime and the blocking USB worker thread.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{
    ClaimMode, TransferOutcome, UsbBridge, UsbCommand, UsbEvent, UsbFailure, UsbTransfer,
    UsbWorker, create_usb_bridge,
};
pub use error::{Error, Result};
pub use logging::setup_logging;

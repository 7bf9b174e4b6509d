//! USB subsystem
//!
//! Device enumeration, hot-plug detection, claiming and transfer execution
//! on top of rusb. All libusb calls run on one dedicated worker thread
//! ([`worker`]); [`backend`] is the async face the rest of the daemon uses.

pub mod backend;
pub mod device;
pub mod manager;
pub mod transfers;
pub mod worker;

pub use backend::{UsbBackend, forward_disconnects};
pub use device::UsbDevice;
pub use manager::DeviceManager;
pub use worker::{UsbWorkerThread, spawn_usb_worker};

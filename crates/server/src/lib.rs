//! usbipd-rs server library
//!
//! Shared by the `usbipd` daemon and the `usbipd-helper` privileged helper.
//!
//! ```text
//! UsbIpServer ── ClientConnection ── RequestProcessor ──┬─ TransferTracker
//!                                                      ├─ TransferExecutor (usb)
//!                                                      └─ ClaimCoordinator
//!                                                            ├─ Route (Supervisor)
//!                                                            │    └─ IpcClient ─► usbipd-helper
//!                                                            └─ DirectClaimer (usb)
//! ```

pub mod claim;
pub mod config;
pub mod ipc;
pub mod network;
pub mod ports;
pub mod service;
pub mod supervisor;
pub mod tracker;
pub mod usb;

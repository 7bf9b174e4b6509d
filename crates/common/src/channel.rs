//! Async channel bridge between Tokio runtime and USB thread
//!
//! libusb calls block, so all of them run on one dedicated worker thread.
//! Async code sends [`UsbCommand`]s carrying a oneshot for the reply; the
//! worker sends hot-plug [`UsbEvent`]s back.

use async_channel::{Receiver, Sender, bounded};
use protocol::{ClaimMethod, Device, DeviceKey, TransferKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::oneshot;

/// How the worker should take a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// Claim interfaces only; fail if a kernel driver holds them
    Exclusive,
    /// Detach kernel drivers first (requires privileges)
    DetachKernelDrivers,
}

/// A libusb failure with its numeric error code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (libusb error {code})")]
pub struct UsbFailure {
    /// libusb error code (LIBUSB_ERROR_*)
    pub code: i32,
    pub message: String,
}

impl UsbFailure {
    pub const ACCESS: i32 = -3;
    pub const NO_DEVICE: i32 = -4;
    pub const NOT_FOUND: i32 = -5;
    pub const BUSY: i32 = -6;
    pub const OTHER: i32 = -99;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_access_denied(&self) -> bool {
        self.code == Self::ACCESS
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.code, Self::NO_DEVICE | Self::NOT_FOUND)
    }
}

/// A transfer handed to the worker thread
#[derive(Debug, Clone)]
pub struct UsbTransfer {
    pub key: DeviceKey,
    pub kind: TransferKind,
    /// Endpoint address including the direction bit (0x80 = IN)
    pub endpoint: u8,
    pub setup: [u8; 8],
    /// OUT payload
    pub data: Vec<u8>,
    /// Requested length (buffer size for IN transfers)
    pub length: u32,
    /// Set by UNLINK; checked by the worker before the transfer starts
    pub cancelled: Arc<AtomicBool>,
}

impl UsbTransfer {
    pub fn is_in(&self) -> bool {
        self.endpoint & 0x80 != 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Result of a transfer in USB/IP terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// 0 on success, negative errno otherwise
    pub status: i32,
    pub actual_length: u32,
    /// IN payload
    pub data: Vec<u8>,
}

impl TransferOutcome {
    pub fn completed(data: Vec<u8>, actual_length: u32) -> Self {
        Self {
            status: 0,
            actual_length,
            data,
        }
    }

    pub fn failed(errno: i32) -> Self {
        Self {
            status: -errno,
            actual_length: 0,
            data: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// List exportable USB devices
    ListDevices {
        response: oneshot::Sender<Vec<Device>>,
    },

    /// Open a device and claim its interfaces
    ClaimDevice {
        key: DeviceKey,
        mode: ClaimMode,
        response: oneshot::Sender<Result<ClaimMethod, UsbFailure>>,
    },

    /// Release interfaces and reattach any detached kernel drivers
    ReleaseDevice {
        key: DeviceKey,
        response: oneshot::Sender<Result<(), UsbFailure>>,
    },

    /// Run one transfer on a claimed device
    Execute {
        transfer: UsbTransfer,
        response: oneshot::Sender<TransferOutcome>,
    },

    /// Shutdown the USB thread gracefully
    Shutdown,
}

/// Hot-plug events from the USB thread
#[derive(Debug, Clone)]
pub enum UsbEvent {
    DeviceArrived { device: Device },
    DeviceLeft { key: DeviceKey },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send a command and wait for the worker's reply
    pub async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> UsbCommand,
    ) -> crate::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send_command(build(tx)).await?;
        rx.await
            .map_err(|_| crate::Error::Channel("USB worker dropped the request".to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
    /// Event sender (public for the hot-plug callback)
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send an event to Tokio runtime (blocking)
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (event_tx, event_rx) = bounded(256);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}

//! Collaborator ports
//!
//! The daemon core talks to USB hardware and to the helper installer only
//! through these traits. The rusb-backed implementations live in
//! [`crate::usb`]; tests substitute in-memory fakes.

use async_trait::async_trait;
use common::{TransferOutcome, UsbFailure};
use protocol::{ClaimMethod, CmdSubmit, Device, DeviceKey, TransferKind};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::tracker::TransferKey;

/// Source of the exportable device list
#[async_trait]
pub trait DeviceFeed: Send + Sync {
    async fn list(&self) -> Vec<Device>;

    /// Look up one device by its USB/IP bus id
    async fn find(&self, bus_id: &str) -> Option<Device> {
        self.list().await.into_iter().find(|d| d.bus_id == bus_id)
    }
}

/// One URB handed to the transfer executor
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub key: TransferKey,
    pub device: DeviceKey,
    pub kind: TransferKind,
    /// Endpoint address including the direction bit (0x80 = IN)
    pub endpoint: u8,
    pub setup: [u8; 8],
    pub data: Vec<u8>,
    pub length: u32,
}

impl TransferRequest {
    pub fn from_submit(key: TransferKey, device: DeviceKey, submit: &CmdSubmit) -> Self {
        let direction = if submit.is_in() { 0x80 } else { 0x00 };
        Self {
            key,
            device,
            kind: submit.transfer_kind(),
            endpoint: (submit.header.ep as u8 & 0x0F) | direction,
            setup: submit.setup,
            data: submit.data.clone(),
            length: submit.transfer_buffer_length,
        }
    }

    pub fn is_in(&self) -> bool {
        self.endpoint & 0x80 != 0
    }
}

/// Executes transfers against claimed hardware
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    async fn execute(&self, request: TransferRequest) -> TransferOutcome;

    /// Best-effort cancellation; `true` if the transfer had not started yet
    async fn cancel(&self, key: TransferKey) -> bool;
}

/// In-process device claiming (the fallback path, and the helper's own path)
#[async_trait]
pub trait DirectClaimer: Send + Sync {
    async fn claim(&self, device: &Device) -> Result<ClaimMethod, UsbFailure>;
    async fn release(&self, key: DeviceKey) -> Result<(), UsbFailure>;
}

/// Result of a successful installer run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Completed,
    /// Installed, but the administrator has to approve it before it runs
    AwaitingApproval,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("helper bundle is not available")]
    BundleUnavailable,

    #[error("installation failed: {0}")]
    Failed(String),

    #[error("installation timed out after {0}s")]
    TimedOut(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Installs the privileged helper
#[async_trait]
pub trait HelperInstaller: Send + Sync {
    /// Path of the helper bundle, if one ships with this installation
    fn bundle_available(&self) -> Option<PathBuf>;

    async fn install(&self, bundle: &Path) -> Result<InstallOutcome, InstallError>;
}

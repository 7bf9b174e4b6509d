//! Async side of the USB worker
//!
//! Implements the daemon's collaborator ports on top of the [`UsbBridge`].

use async_trait::async_trait;
use common::{
    ClaimMode, TransferOutcome, UsbBridge, UsbCommand, UsbEvent, UsbFailure, UsbTransfer,
};
use protocol::{ClaimMethod, Device, DeviceKey, errno};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::claim::ClaimCoordinator;
use crate::ports::{DeviceFeed, DirectClaimer, TransferExecutor, TransferRequest};
use crate::tracker::TransferKey;

pub struct UsbBackend {
    bridge: UsbBridge,
    mode: ClaimMode,
    /// Cancellation flags of transfers queued on the worker
    queued: Mutex<HashMap<TransferKey, Arc<AtomicBool>>>,
}

impl UsbBackend {
    /// `mode` is how this process takes devices: the daemon claims
    /// interfaces exclusively, the helper detaches kernel drivers
    pub fn new(bridge: UsbBridge, mode: ClaimMode) -> Self {
        Self {
            bridge,
            mode,
            queued: Mutex::new(HashMap::new()),
        }
    }

    pub fn bridge(&self) -> &UsbBridge {
        &self.bridge
    }
}

fn bridge_failure(e: common::Error) -> UsbFailure {
    UsbFailure::new(UsbFailure::OTHER, e.to_string())
}

#[async_trait]
impl DeviceFeed for UsbBackend {
    async fn list(&self) -> Vec<Device> {
        match self
            .bridge
            .request(|response| UsbCommand::ListDevices { response })
            .await
        {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Device listing failed: {}", e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl DirectClaimer for UsbBackend {
    async fn claim(&self, device: &Device) -> Result<ClaimMethod, UsbFailure> {
        let key = device.key();
        let mode = self.mode;
        self.bridge
            .request(|response| UsbCommand::ClaimDevice {
                key,
                mode,
                response,
            })
            .await
            .map_err(bridge_failure)?
    }

    async fn release(&self, key: DeviceKey) -> Result<(), UsbFailure> {
        self.bridge
            .request(|response| UsbCommand::ReleaseDevice { key, response })
            .await
            .map_err(bridge_failure)?
    }
}

#[async_trait]
impl TransferExecutor for UsbBackend {
    async fn execute(&self, request: TransferRequest) -> TransferOutcome {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.queued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(request.key, Arc::clone(&cancelled));

        let transfer = UsbTransfer {
            key: request.device,
            kind: request.kind,
            endpoint: request.endpoint,
            setup: request.setup,
            data: request.data,
            length: request.length,
            cancelled,
        };
        let outcome = self
            .bridge
            .request(|response| UsbCommand::Execute { transfer, response })
            .await;

        self.queued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&request.key);

        outcome.unwrap_or_else(|e| {
            warn!("Transfer {} lost: {}", request.key, e);
            TransferOutcome::failed(errno::ESHUTDOWN)
        })
    }

    async fn cancel(&self, key: TransferKey) -> bool {
        let queued = self.queued.lock().unwrap_or_else(|p| p.into_inner());
        match queued.get(&key) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }
}

/// Drop claims of devices that were unplugged
///
/// Runs until the worker's event channel closes.
pub async fn forward_disconnects(bridge: UsbBridge, coordinator: Arc<ClaimCoordinator>) {
    while let Ok(event) = bridge.recv_event().await {
        match event {
            UsbEvent::DeviceArrived { device } => {
                debug!("Device {} ({}) arrived", device.key(), device.bus_id);
            }
            UsbEvent::DeviceLeft { key } => {
                if coordinator.mark_disconnected(key).await {
                    info!("Claimed device {} was unplugged", key);
                }
            }
        }
    }
    debug!("USB event stream closed");
}

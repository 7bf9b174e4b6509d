//! In-memory collaborators shared by the server integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use common::{TransferOutcome, UsbFailure};
use protocol::{
    ClaimMethod, Device, DeviceKey, IpcCommand, IpcErrorKind, IpcErrorPayload, IpcRequest,
    IpcResult,
};
use server::claim::ClaimCoordinator;
use server::ipc::{IpcClientOptions, IpcHandler, IpcServer, IpcServerOptions, RequestContext};
use server::ports::{
    DeviceFeed, DirectClaimer, HelperInstaller, InstallError, InstallOutcome, TransferExecutor,
    TransferRequest,
};
use server::tracker::TransferKey;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

// ============================================================================
// USB
// ============================================================================

/// Device list plus direct claiming, backed by plain collections
pub struct FakeUsb {
    devices: Mutex<Vec<Device>>,
    claimed: Mutex<HashSet<DeviceKey>>,
    failures: Mutex<HashMap<DeviceKey, UsbFailure>>,
    method: ClaimMethod,
    claim_delay: Duration,
    release_delay: Duration,
    claims: AtomicUsize,
    releases: AtomicUsize,
}

impl FakeUsb {
    pub fn new(devices: Vec<Device>) -> Arc<Self> {
        Arc::new(Self::build(devices, ClaimMethod::ExclusiveAccess, Duration::ZERO))
    }

    /// Claims return `method` (a helper detaching drivers, for example)
    pub fn with_method(devices: Vec<Device>, method: ClaimMethod) -> Arc<Self> {
        Arc::new(Self::build(devices, method, Duration::ZERO))
    }

    /// Every claim takes `delay`, which widens race windows
    pub fn slow(devices: Vec<Device>, delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(devices, ClaimMethod::ExclusiveAccess, delay))
    }

    /// Slow claims that return `method`
    pub fn slow_with_method(devices: Vec<Device>, method: ClaimMethod, delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(devices, method, delay))
    }

    /// Every release takes `delay` before the device is let go
    pub fn slow_release(devices: Vec<Device>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            release_delay: delay,
            ..Self::build(devices, ClaimMethod::ExclusiveAccess, Duration::ZERO)
        })
    }

    fn build(devices: Vec<Device>, method: ClaimMethod, claim_delay: Duration) -> Self {
        Self {
            devices: Mutex::new(devices),
            claimed: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
            method,
            claim_delay,
            release_delay: Duration::ZERO,
            claims: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    pub fn unplug(&self, key: DeviceKey) {
        self.devices.lock().unwrap().retain(|d| d.key() != key);
        self.claimed.lock().unwrap().remove(&key);
    }

    /// Claims of `key` fail with `failure` until [`FakeUsb::heal`]
    pub fn fail_claims(&self, key: DeviceKey, failure: UsbFailure) {
        self.failures.lock().unwrap().insert(key, failure);
    }

    pub fn heal(&self, key: DeviceKey) {
        self.failures.lock().unwrap().remove(&key);
    }

    pub fn is_held(&self, key: DeviceKey) -> bool {
        self.claimed.lock().unwrap().contains(&key)
    }

    pub fn claim_count(&self) -> usize {
        self.claims.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceFeed for FakeUsb {
    async fn list(&self) -> Vec<Device> {
        self.devices.lock().unwrap().clone()
    }
}

#[async_trait]
impl DirectClaimer for FakeUsb {
    async fn claim(&self, device: &Device) -> Result<ClaimMethod, UsbFailure> {
        if !self.claim_delay.is_zero() {
            tokio::time::sleep(self.claim_delay).await;
        }
        let key = device.key();
        if let Some(failure) = self.failures.lock().unwrap().get(&key) {
            return Err(failure.clone());
        }
        if !self.claimed.lock().unwrap().insert(key) {
            return Err(UsbFailure::new(UsbFailure::BUSY, "interface already claimed"));
        }
        self.claims.fetch_add(1, Ordering::SeqCst);
        Ok(self.method.clone())
    }

    async fn release(&self, key: DeviceKey) -> Result<(), UsbFailure> {
        if !self.release_delay.is_zero() {
            tokio::time::sleep(self.release_delay).await;
        }
        if self.claimed.lock().unwrap().remove(&key) {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        } else {
            Err(UsbFailure::new(UsbFailure::NOT_FOUND, "device not open"))
        }
    }
}

/// Transfer executor whose transfers wait for permits
///
/// IN transfers return `length` bytes of 0xAB; OUT transfers report the
/// payload as written.
pub struct FakeExecutor {
    gate: Semaphore,
    executed: Mutex<Vec<TransferRequest>>,
    cancelled: Mutex<Vec<TransferKey>>,
}

impl FakeExecutor {
    /// Transfers complete as soon as they run
    pub fn immediate() -> Arc<Self> {
        Arc::new(Self::with_permits(Semaphore::MAX_PERMITS))
    }

    /// Transfers block until [`FakeExecutor::finish`] lets them through
    pub fn gated() -> Arc<Self> {
        Arc::new(Self::with_permits(0))
    }

    fn with_permits(permits: usize) -> Self {
        Self {
            gate: Semaphore::new(permits),
            executed: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn finish(&self, count: usize) {
        self.gate.add_permits(count);
    }

    pub fn executed(&self) -> Vec<TransferRequest> {
        self.executed.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<TransferKey> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransferExecutor for FakeExecutor {
    async fn execute(&self, request: TransferRequest) -> TransferOutcome {
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        let outcome = if request.is_in() {
            TransferOutcome::completed(vec![0xAB; request.length as usize], request.length)
        } else {
            TransferOutcome::completed(Vec::new(), request.data.len() as u32)
        };
        self.executed.lock().unwrap().push(request);
        outcome
    }

    async fn cancel(&self, key: TransferKey) -> bool {
        self.cancelled.lock().unwrap().push(key);
        true
    }
}

// ============================================================================
// Helper installation
// ============================================================================

pub struct FakeInstaller {
    bundle: Option<PathBuf>,
    delay: Duration,
    outcome: Result<InstallOutcome, String>,
    calls: AtomicUsize,
}

impl FakeInstaller {
    pub fn new(bundle: Option<PathBuf>, outcome: Result<InstallOutcome, String>) -> Arc<Self> {
        Self::slow(bundle, outcome, Duration::ZERO)
    }

    pub fn slow(
        bundle: Option<PathBuf>,
        outcome: Result<InstallOutcome, String>,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            bundle,
            delay,
            outcome,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HelperInstaller for FakeInstaller {
    fn bundle_available(&self) -> Option<PathBuf> {
        self.bundle.clone()
    }

    async fn install(&self, _bundle: &Path) -> Result<InstallOutcome, InstallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.outcome.clone().map_err(InstallError::Failed)
    }
}

// ============================================================================
// IPC
// ============================================================================

/// Answers health checks at once and sleeps `delay` before everything else
pub struct SlowHandler {
    pub delay: Duration,
    pub handled: AtomicUsize,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            handled: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl IpcHandler for SlowHandler {
    async fn handle(
        &self,
        request: &IpcRequest,
        _context: &RequestContext,
    ) -> Result<IpcResult, IpcErrorPayload> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        match request.command {
            IpcCommand::HealthCheck => Ok(IpcResult::Health { uptime_secs: 1 }),
            IpcCommand::GetClaimedDevices => {
                tokio::time::sleep(self.delay).await;
                Ok(IpcResult::ClaimedDevices(Vec::new()))
            }
            other => Err(IpcErrorPayload::new(
                IpcErrorKind::InvalidRequest,
                format!("{} not supported here", other),
            )),
        }
    }
}

pub fn server_options(socket_path: &Path) -> IpcServerOptions {
    IpcServerOptions {
        socket_path: socket_path.to_path_buf(),
        allowed_clients: vec!["usbipd".to_string()],
        max_connections: 4,
        max_pending: 16,
        request_timeout: Duration::from_secs(5),
    }
}

pub fn client_options(request_timeout: Duration) -> IpcClientOptions {
    IpcClientOptions {
        client_id: "usbipd".to_string(),
        request_timeout,
        max_pending: 16,
    }
}

pub async fn start_server(
    options: IpcServerOptions,
    handler: Arc<dyn IpcHandler>,
) -> Arc<IpcServer> {
    IpcServer::start(options, handler)
        .await
        .expect("helper socket should bind")
}

/// Coordinator with no helper, claiming through `usb`
pub fn direct_coordinator(usb: &Arc<FakeUsb>) -> ClaimCoordinator {
    ClaimCoordinator::direct_only(usb.clone(), usb.clone())
}

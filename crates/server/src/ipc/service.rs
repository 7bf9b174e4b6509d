//! Request handling inside the privileged helper

use async_trait::async_trait;
use protocol::{
    HelperStatus, IpcCommand, IpcErrorKind, IpcErrorPayload, IpcRequest, IpcResult,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::server::{IpcHandler, RequestContext};
use crate::claim::{ClaimCoordinator, ClaimedDevice};

/// Serves claim requests from the daemon with the helper's own coordinator
pub struct HelperService {
    coordinator: Arc<ClaimCoordinator>,
    started: Instant,
}

impl HelperService {
    pub fn new(coordinator: Arc<ClaimCoordinator>) -> Self {
        Self {
            coordinator,
            started: Instant::now(),
        }
    }

    fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    async fn claim(&self, request: &IpcRequest) -> Result<IpcResult, IpcErrorPayload> {
        let key = request.device_key().ok_or_else(|| {
            IpcErrorPayload::new(IpcErrorKind::InvalidRequest, "missing device key")
        })?;
        let device = self
            .coordinator
            .feed()
            .list()
            .await
            .into_iter()
            .find(|d| d.key() == key && request.param("bus_id").is_none_or(|b| b == d.bus_id))
            .ok_or_else(|| {
                IpcErrorPayload::new(
                    IpcErrorKind::DeviceNotFound,
                    format!("no device {} attached", key),
                )
            })?;

        let coordinator = Arc::clone(&self.coordinator);
        let verify = request.is_verify();
        let claimed = run_to_completion(async move {
            if verify {
                coordinator.verify(&device).await
            } else {
                coordinator.claim(&device).await
            }
        })
        .await?;
        claimed
            .map(|c| IpcResult::Claimed(c.to_record()))
            .map_err(|e| (&e).into())
    }

    async fn release(&self, request: &IpcRequest) -> Result<IpcResult, IpcErrorPayload> {
        let key = request.device_key().ok_or_else(|| {
            IpcErrorPayload::new(IpcErrorKind::InvalidRequest, "missing device key")
        })?;
        let coordinator = Arc::clone(&self.coordinator);
        run_to_completion(async move { coordinator.release(key).await })
            .await?
            .map(|()| IpcResult::Released)
            .map_err(|e| (&e).into())
    }
}

/// Run a device operation on its own task
///
/// The server drops handler futures on timeout or shutdown; the spawned
/// task still finishes, so a claim is never left half made.
async fn run_to_completion<F, T>(operation: F) -> Result<T, IpcErrorPayload>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(operation).await.map_err(|e| {
        IpcErrorPayload::new(
            IpcErrorKind::Internal,
            format!("device operation failed: {}", e),
        )
    })
}

#[async_trait]
impl IpcHandler for HelperService {
    async fn handle(
        &self,
        request: &IpcRequest,
        context: &RequestContext,
    ) -> Result<IpcResult, IpcErrorPayload> {
        debug!(
            "Helper request {} {} from '{}'",
            request.request_id, request.command, request.client_id
        );
        match request.command {
            IpcCommand::ClaimDevice => self.claim(request).await,
            IpcCommand::ReleaseDevice => self.release(request).await,
            IpcCommand::GetClaimedDevices => Ok(IpcResult::ClaimedDevices(
                self.coordinator
                    .list_claimed()
                    .iter()
                    .map(ClaimedDevice::to_record)
                    .collect(),
            )),
            IpcCommand::GetStatus => Ok(IpcResult::Status(HelperStatus {
                running: true,
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: self.uptime_secs(),
                claimed_devices: self.coordinator.list_claimed().len() as u32,
                active_connections: context.active_connections as u32,
            })),
            IpcCommand::HealthCheck => Ok(IpcResult::Health {
                uptime_secs: self.uptime_secs(),
            }),
            IpcCommand::GetClaimHistory => Ok(IpcResult::History(self.coordinator.history())),
            IpcCommand::Shutdown => Ok(IpcResult::ShuttingDown),
        }
    }
}

//! Daemon side of the helper channel
//!
//! One connection multiplexes many requests. Each request gets a fresh id
//! and a slot in the pending table; the reader task routes responses back by
//! id. A request that outlives its timeout is purged from the table and
//! resolved with exactly one [`IpcError::Timeout`]; a response arriving after
//! that is counted as late and dropped. Nothing is retried here.

use protocol::{
    ClaimHistoryEntry, ClaimRecord, Device, DeviceKey, HelperStatus, IpcCommand, IpcRequest,
    IpcResponse, IpcResult, RequestId, params, read_frame_async, write_frame_async,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::IpcError;
use crate::config::IpcSettings;

type Reply = Result<IpcResponse, IpcError>;

#[derive(Debug, Clone)]
pub struct IpcClientOptions {
    pub client_id: String,
    pub request_timeout: Duration,
    pub max_pending: usize,
}

impl From<&IpcSettings> for IpcClientOptions {
    fn from(settings: &IpcSettings) -> Self {
        Self {
            client_id: settings.client_id.clone(),
            request_timeout: settings.request_timeout(),
            max_pending: settings.max_pending_requests,
        }
    }
}

/// Counters exposed for status reporting and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpcClientStats {
    pub sent: u64,
    pub timed_out: u64,
    pub late_responses: u64,
    pub pending: usize,
    pub closed: bool,
}

struct PendingRequest {
    command: IpcCommand,
    deadline: Instant,
    reply: oneshot::Sender<Reply>,
}

pub struct IpcClient {
    options: IpcClientOptions,
    writer: AsyncMutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    next_id: AtomicU64,
    sent: AtomicU64,
    timed_out: AtomicU64,
    late_responses: AtomicU64,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IpcClient {
    /// Connect to the helper socket and start the reader and sweep tasks
    pub async fn connect(
        socket_path: &Path,
        options: IpcClientOptions,
    ) -> Result<Arc<Self>, IpcError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(IpcError::Connect)?;
        debug!("Connected to helper at {}", socket_path.display());
        Ok(Self::from_stream(stream, options))
    }

    pub fn from_stream(stream: UnixStream, options: IpcClientOptions) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        let sweep_period = options.request_timeout;
        let (closed_tx, _) = watch::channel(false);

        let client = Arc::new(Self {
            options,
            writer: AsyncMutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sent: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            late_responses: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closed_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let reader_task = tokio::spawn(read_loop(reader, Arc::downgrade(&client)));
        let sweep_task = tokio::spawn(sweep_loop(Arc::downgrade(&client), sweep_period));
        client
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend([reader_task, sweep_task]);

        client
    }

    pub fn client_id(&self) -> &str {
        &self.options.client_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the channel is closed, by either side
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn stats(&self) -> IpcClientStats {
        IpcClientStats {
            sent: self.sent.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            late_responses: self.late_responses.load(Ordering::Relaxed),
            pending: self.lock_pending().len(),
            closed: self.is_closed(),
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Send a request and wait for its response or its timeout
    ///
    /// The id and client id of `request` are assigned here. A failed response
    /// from the helper is returned as `Ok`; see [`IpcResponse::into_result`].
    pub async fn send(&self, mut request: IpcRequest) -> Result<IpcResponse, IpcError> {
        if self.is_closed() {
            return Err(IpcError::ChannelClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        request.request_id = id;
        request.client_id = self.options.client_id.clone();

        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.lock_pending();
            if pending.len() >= self.options.max_pending {
                warn!(
                    "Rejecting {} request: {} requests already pending",
                    request.command,
                    pending.len()
                );
                return Err(IpcError::Busy);
            }
            pending.insert(
                id,
                PendingRequest {
                    command: request.command,
                    deadline: Instant::now() + self.options.request_timeout,
                    reply: tx,
                },
            );
        }

        let written = {
            let mut writer = self.writer.lock().await;
            write_frame_async(&mut *writer, &request).await
        };
        if let Err(e) = written {
            self.lock_pending().remove(&id);
            warn!("Failed to send {} request to helper: {}", request.command, e);
            self.shutdown_pending();
            return Err(IpcError::Frame(e));
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        debug!("Sent {} request {}", request.command, id);

        match tokio::time::timeout(self.options.request_timeout, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(IpcError::ChannelClosed),
            Err(_) => {
                if self.lock_pending().remove(&id).is_some() {
                    self.timed_out.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "{} request {} timed out after {:?}",
                        request.command, id, self.options.request_timeout
                    );
                    Err(IpcError::Timeout)
                } else {
                    // Resolved concurrently by the reader or the sweep
                    rx.await.unwrap_or(Err(IpcError::ChannelClosed))
                }
            }
        }
    }

    fn route_response(&self, response: IpcResponse) {
        let entry = self.lock_pending().remove(&response.request_id);
        match entry {
            Some(pending) => {
                debug!(
                    "Received response to {} request {}",
                    pending.command, response.request_id
                );
                let _ = pending.reply.send(Ok(response));
            }
            None => match response.error {
                // Id 0 is never assigned: the helper is refusing the whole connection
                Some(error) if response.request_id == 0 => {
                    warn!("Helper rejected the connection: {}", error);
                    self.close_with(|| IpcError::from(error.clone()));
                }
                _ => {
                    self.late_responses.fetch_add(1, Ordering::Relaxed);
                    debug!("Dropping late or unknown response {}", response.request_id);
                }
            },
        }
    }

    /// Purge requests past their deadline
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(RequestId, PendingRequest)> = {
            let mut pending = self.lock_pending();
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        for (id, request) in &expired {
            warn!("Sweeping expired {} request {}", request.command, id);
        }
        let count = expired.len();
        for (_, request) in expired {
            self.timed_out.fetch_add(1, Ordering::Relaxed);
            let _ = request.reply.send(Err(IpcError::Timeout));
        }
        count
    }

    /// Mark closed and resolve everything in flight with `ChannelClosed`
    fn shutdown_pending(&self) {
        self.close_with(|| IpcError::ChannelClosed);
    }

    fn close_with(&self, error: impl Fn() -> IpcError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<PendingRequest> = self.lock_pending().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            info!(
                "Helper channel closed with {} requests in flight",
                drained.len()
            );
        }
        for request in drained {
            let _ = request.reply.send(Err(error()));
        }
        self.closed_tx.send_replace(true);
    }

    /// Close the channel
    pub async fn stop(&self) {
        self.shutdown_pending();
        for task in self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
        let _ = self.writer.lock().await.shutdown().await;
    }

    async fn call(&self, request: IpcRequest) -> Result<IpcResult, IpcError> {
        self.send(request).await?.into_result().map_err(IpcError::from)
    }

    fn request(&self, command: IpcCommand) -> IpcRequest {
        IpcRequest::new(command, self.options.client_id.clone())
    }

    /// Ask the helper to claim `device`; `verify` re-confirms an existing claim
    pub async fn claim_device(&self, device: &Device, verify: bool) -> Result<ClaimRecord, IpcError> {
        let mut request = self
            .request(IpcCommand::ClaimDevice)
            .for_device(device.key(), &device.bus_id);
        if verify {
            request = request.with_param(params::VERIFY, true);
        }
        match self.call(request).await? {
            IpcResult::Claimed(record) => Ok(record),
            _ => Err(IpcError::UnexpectedResponse(IpcCommand::ClaimDevice)),
        }
    }

    pub async fn release_device(&self, key: DeviceKey, bus_id: &str) -> Result<(), IpcError> {
        let request = self.request(IpcCommand::ReleaseDevice).for_device(key, bus_id);
        match self.call(request).await? {
            IpcResult::Released => Ok(()),
            _ => Err(IpcError::UnexpectedResponse(IpcCommand::ReleaseDevice)),
        }
    }

    pub async fn claimed_devices(&self) -> Result<Vec<ClaimRecord>, IpcError> {
        match self.call(self.request(IpcCommand::GetClaimedDevices)).await? {
            IpcResult::ClaimedDevices(records) => Ok(records),
            _ => Err(IpcError::UnexpectedResponse(IpcCommand::GetClaimedDevices)),
        }
    }

    pub async fn status(&self) -> Result<HelperStatus, IpcError> {
        match self.call(self.request(IpcCommand::GetStatus)).await? {
            IpcResult::Status(status) => Ok(status),
            _ => Err(IpcError::UnexpectedResponse(IpcCommand::GetStatus)),
        }
    }

    /// Returns the helper's uptime in seconds
    pub async fn health_check(&self) -> Result<u64, IpcError> {
        match self.call(self.request(IpcCommand::HealthCheck)).await? {
            IpcResult::Health { uptime_secs } => Ok(uptime_secs),
            _ => Err(IpcError::UnexpectedResponse(IpcCommand::HealthCheck)),
        }
    }

    pub async fn claim_history(&self) -> Result<Vec<ClaimHistoryEntry>, IpcError> {
        match self.call(self.request(IpcCommand::GetClaimHistory)).await? {
            IpcResult::History(entries) => Ok(entries),
            _ => Err(IpcError::UnexpectedResponse(IpcCommand::GetClaimHistory)),
        }
    }

    pub async fn shutdown_helper(&self) -> Result<(), IpcError> {
        match self.call(self.request(IpcCommand::Shutdown)).await? {
            IpcResult::ShuttingDown => Ok(()),
            _ => Err(IpcError::UnexpectedResponse(IpcCommand::Shutdown)),
        }
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, client: Weak<IpcClient>) {
    loop {
        let frame = read_frame_async::<_, IpcResponse>(&mut reader).await;
        let Some(client) = client.upgrade() else {
            return;
        };
        match frame {
            Ok(Some(response)) => client.route_response(response),
            Ok(None) => {
                info!("Helper closed the IPC connection");
                client.shutdown_pending();
                return;
            }
            Err(e) => {
                warn!("Helper IPC read failed: {}", e);
                client.shutdown_pending();
                return;
            }
        }
    }
}

async fn sweep_loop(client: Weak<IpcClient>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(client) = client.upgrade() else {
            return;
        };
        if client.is_closed() {
            return;
        }
        let purged = client.sweep();
        if purged > 0 {
            debug!("IPC sweep purged {} requests", purged);
        }
    }
}

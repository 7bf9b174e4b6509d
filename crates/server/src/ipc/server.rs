//! Helper side of the IPC channel
//!
//! Accepts daemon connections on a Unix socket, authenticates every request
//! against the client allowlist, and runs handlers concurrently with a
//! per-request time budget. Both the connection count and the number of
//! in-flight requests are capped; excess is rejected with an error frame
//! instead of queued.

use async_trait::async_trait;
use protocol::{
    IpcCommand, IpcErrorKind, IpcErrorPayload, IpcRequest, IpcResponse, IpcResult, RequestId,
    read_frame_async, write_frame_async,
};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::IpcError;
use crate::config::IpcSettings;

#[derive(Debug, Clone)]
pub struct IpcServerOptions {
    pub socket_path: PathBuf,
    pub allowed_clients: Vec<String>,
    pub max_connections: usize,
    pub max_pending: usize,
    pub request_timeout: Duration,
}

impl From<&IpcSettings> for IpcServerOptions {
    fn from(settings: &IpcSettings) -> Self {
        Self {
            socket_path: settings.socket_path(),
            allowed_clients: settings.allowed_clients.clone(),
            max_connections: settings.max_connections,
            max_pending: settings.max_pending_requests,
            request_timeout: settings.request_timeout(),
        }
    }
}

/// Server state visible to handlers
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub active_connections: usize,
}

#[async_trait]
pub trait IpcHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        request: &IpcRequest,
        context: &RequestContext,
    ) -> Result<IpcResult, IpcErrorPayload>;
}

type ConnectionId = u64;

struct InFlight {
    responder: mpsc::Sender<IpcResponse>,
    task: AbortHandle,
}

pub struct IpcServer {
    options: IpcServerOptions,
    handler: Arc<dyn IpcHandler>,
    connections: Arc<Semaphore>,
    inflight: Mutex<HashMap<(ConnectionId, RequestId), InFlight>>,
    next_connection: AtomicU64,
    stopped: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl IpcServer {
    /// Bind the socket and start accepting connections
    ///
    /// A socket file left behind by a previous run is removed first.
    pub async fn start(
        options: IpcServerOptions,
        handler: Arc<dyn IpcHandler>,
    ) -> Result<Arc<Self>, IpcError> {
        let path = &options.socket_path;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(IpcError::Bind)?;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!("Removed stale helper socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(IpcError::Bind(e)),
        }

        let listener = UnixListener::bind(path).map_err(IpcError::Bind)?;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)) {
            warn!("Failed to restrict helper socket permissions: {}", e);
        }
        info!("Helper listening on {}", path.display());

        let (stopped, _) = watch::channel(false);
        let server = Arc::new(Self {
            connections: Arc::new(Semaphore::new(options.max_connections)),
            options,
            handler,
            inflight: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            stopped,
            accept_task: Mutex::new(None),
        });

        let task = tokio::spawn(server.clone().accept_loop(listener));
        *server.accept_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
        Ok(server)
    }

    /// Minimal identity check: the client id must be on the allowlist
    pub fn authenticate(&self, client_id: &str) -> bool {
        self.options.allowed_clients.iter().any(|c| c == client_id)
    }

    pub fn active_connections(&self) -> usize {
        self.options.max_connections - self.connections.available_permits()
    }

    pub fn inflight_requests(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Resolves once the server has been stopped
    pub async fn stopped(&self) {
        let mut rx = self.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Stop accepting and answer every in-flight request with `ChannelClosed`
    pub async fn stop(&self) {
        if self.stopped.send_replace(true) {
            return;
        }

        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }

        let drained: Vec<((ConnectionId, RequestId), InFlight)> = self
            .inflight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .collect();
        if !drained.is_empty() {
            info!("Closing {} in-flight helper requests", drained.len());
        }
        for ((_, request_id), entry) in drained {
            entry.task.abort();
            let closed = IpcErrorPayload::new(IpcErrorKind::ChannelClosed, "helper stopping");
            let _ = entry
                .responder
                .send(IpcResponse::err(request_id, closed))
                .await;
        }

        if let Err(e) = tokio::fs::remove_file(&self.options.socket_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!("Failed to remove helper socket: {}", e);
        }
        info!("Helper IPC server stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: UnixListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.stopped() => return,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _addr)) => self.clone().admit(stream),
                Err(e) => {
                    error!("Helper accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    fn admit(self: Arc<Self>, stream: UnixStream) {
        match self.connections.clone().try_acquire_owned() {
            Ok(permit) => {
                let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
                if let Ok(cred) = stream.peer_cred() {
                    debug!(
                        "Helper connection {} from uid {} pid {:?}",
                        id,
                        cred.uid(),
                        cred.pid()
                    );
                }
                tokio::spawn(self.serve(id, stream, permit));
            }
            Err(_) => {
                warn!(
                    "Rejecting helper connection: limit of {} reached",
                    self.options.max_connections
                );
                tokio::spawn(async move {
                    let mut stream = stream;
                    let rejection = IpcResponse::err(
                        0,
                        IpcErrorPayload::new(
                            IpcErrorKind::ConnectionLimit,
                            "too many connections",
                        ),
                    );
                    let _ = write_frame_async(&mut stream, &rejection).await;
                    let _ = stream.shutdown().await;
                });
            }
        }
    }

    async fn serve(
        self: Arc<Self>,
        connection: ConnectionId,
        stream: UnixStream,
        _permit: OwnedSemaphorePermit,
    ) {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<IpcResponse>(self.options.max_pending.max(1));

        let writer_task = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                if let Err(e) = write_frame_async(&mut writer, &response).await {
                    debug!("Helper connection write failed: {}", e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        loop {
            let frame = tokio::select! {
                _ = self.stopped() => break,
                frame = read_frame_async::<_, IpcRequest>(&mut reader) => frame,
            };
            match frame {
                Ok(Some(request)) => {
                    if !self.clone().dispatch(connection, request, &tx).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Helper connection {} closed by peer", connection);
                    break;
                }
                Err(e) => {
                    warn!("Helper connection {} read failed: {}", connection, e);
                    break;
                }
            }
        }

        // Handlers of a vanished connection have nobody to answer
        let orphaned: Vec<InFlight> = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            let keys: Vec<_> = inflight
                .keys()
                .filter(|(conn, _)| *conn == connection)
                .copied()
                .collect();
            keys.iter().filter_map(|k| inflight.remove(k)).collect()
        };
        for entry in orphaned {
            entry.task.abort();
        }

        drop(tx);
        let _ = writer_task.await;
    }

    /// Handle one request; `false` closes the connection
    async fn dispatch(
        self: Arc<Self>,
        connection: ConnectionId,
        request: IpcRequest,
        tx: &mpsc::Sender<IpcResponse>,
    ) -> bool {
        let id = request.request_id;

        if !self.authenticate(&request.client_id) {
            warn!(
                "Rejecting {} request from unknown client '{}'",
                request.command, request.client_id
            );
            let denied = IpcErrorPayload::new(
                IpcErrorKind::AuthenticationFailed,
                "client is not allowed",
            );
            let _ = tx.send(IpcResponse::err(id, denied)).await;
            return false;
        }

        if request.command == IpcCommand::Shutdown {
            info!("Shutdown requested by '{}'", request.client_id);
            let _ = tx.send(IpcResponse::ok(id, IpcResult::ShuttingDown)).await;
            self.stop().await;
            return false;
        }

        let rejection = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            let key = (connection, id);
            if inflight.contains_key(&key) {
                Some(IpcErrorPayload::new(
                    IpcErrorKind::InvalidRequest,
                    format!("request id {} is already in flight", id),
                ))
            } else if inflight.len() >= self.options.max_pending {
                Some(IpcErrorPayload::new(
                    IpcErrorKind::Busy,
                    "too many requests in flight",
                ))
            } else {
                let task = tokio::spawn(self.clone().run_handler(key, request));
                inflight.insert(
                    key,
                    InFlight {
                        responder: tx.clone(),
                        task: task.abort_handle(),
                    },
                );
                None
            }
        };

        if let Some(error) = rejection {
            warn!("Rejecting helper request {}: {}", id, error.message);
            let _ = tx.send(IpcResponse::err(id, error)).await;
        }
        true
    }

    async fn run_handler(self: Arc<Self>, key: (ConnectionId, RequestId), request: IpcRequest) {
        let context = RequestContext {
            active_connections: self.active_connections(),
        };
        let budget = self.options.request_timeout;

        let response = match tokio::time::timeout(budget, self.handler.handle(&request, &context)).await
        {
            Ok(Ok(result)) => IpcResponse::ok(key.1, result),
            Ok(Err(error)) => {
                debug!("{} request {} failed: {}", request.command, key.1, error);
                IpcResponse::err(key.1, error)
            }
            Err(_) => {
                warn!(
                    "{} request {} exceeded {:?}",
                    request.command, key.1, budget
                );
                IpcResponse::err(
                    key.1,
                    IpcErrorPayload::new(IpcErrorKind::Timeout, "handler timed out"),
                )
            }
        };

        // Whoever removes the entry owns the single response
        let entry = self
            .inflight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&key);
        if let Some(entry) = entry {
            let _ = entry.responder.send(response).await;
        }
    }
}

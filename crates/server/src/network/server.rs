//! USB/IP TCP server
//!
//! Accepts client connections and runs each one as its own task. The number
//! of concurrent connections is capped; excess connections are closed
//! immediately.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::connection::ClientConnection;
use super::processor::RequestProcessor;

pub struct UsbIpServer {
    listener: TcpListener,
    processor: Arc<RequestProcessor>,
    connections: Arc<Semaphore>,
    max_connections: usize,
    next_session: AtomicU64,
}

impl UsbIpServer {
    pub async fn bind(
        addr: &str,
        max_connections: usize,
        processor: Arc<RequestProcessor>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind USB/IP listener on {}", addr))?;
        info!("USB/IP server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            processor,
            connections: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            next_session: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };

            let Ok(permit) = self.connections.clone().try_acquire_owned() else {
                warn!(
                    "Rejecting connection from {}: limit of {} reached",
                    peer, self.max_connections
                );
                drop(stream);
                continue;
            };

            let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
            debug!("Accepted connection from {} as session {}", peer, session_id);
            let connection = ClientConnection::new(session_id, stream, self.processor.clone());

            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = connection.run().await {
                    error!("Connection error: {:#}", e);
                }
            });
        }
    }
}

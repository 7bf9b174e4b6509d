//! One USB/IP client connection
//!
//! The read half feeds the processor; replies flow through a bounded queue
//! to a dedicated writer task, so completions of concurrent SUBMITs can be
//! written while the reader waits for the next command.

use anyhow::{Context, Result};
use bytes::BytesMut;
use protocol::{UsbIpCommand, UsbIpReply, read_message, write_message};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::processor::{RequestProcessor, Session};
use crate::tracker::SessionId;

/// Replies buffered per connection before SUBMIT tasks wait on the writer
const REPLY_QUEUE: usize = 256;

pub struct ClientConnection {
    session: Session,
    stream: TcpStream,
    processor: Arc<RequestProcessor>,
}

impl ClientConnection {
    pub fn new(session_id: SessionId, stream: TcpStream, processor: Arc<RequestProcessor>) -> Self {
        Self {
            session: Session::new(session_id),
            stream,
            processor,
        }
    }

    /// Serve the connection until the client disconnects or misbehaves
    pub async fn run(self) -> Result<()> {
        let Self {
            mut session,
            stream,
            processor,
        } = self;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;

        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<UsbIpReply>(REPLY_QUEUE);

        let writer_task = tokio::spawn(async move {
            while let Some(reply) = rx.recv().await {
                if let Err(e) = write_message(&mut writer, &reply).await {
                    debug!("Write to client failed: {}", e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let mut buf = BytesMut::with_capacity(64 * 1024);
        let result = loop {
            let command = match read_message::<UsbIpCommand, _>(&mut reader, &mut buf).await {
                Ok(Some(command)) => command,
                Ok(None) => break Ok(()),
                Err(e) => break Err(anyhow::Error::new(e).context("Malformed USB/IP stream")),
            };
            if let Err(e) = processor.process(&mut session, command, &tx).await {
                break Err(anyhow::Error::new(e).context("Protocol violation"));
            }
        };

        let session_id = session.id();
        processor.close_session(session).await;
        drop(tx);
        let _ = writer_task.await;

        info!("Connection {} (session {}) closed", peer, session_id);
        result
    }
}

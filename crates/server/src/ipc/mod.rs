//! IPC channel between the daemon and the privileged helper
//!
//! Length-prefixed postcard frames over a Unix domain socket. The helper runs
//! an [`IpcServer`]; the daemon holds one [`IpcClient`] connection while the
//! privileged path is active.

pub mod client;
pub mod server;
pub mod service;

pub use client::{IpcClient, IpcClientOptions, IpcClientStats};
pub use server::{IpcHandler, IpcServer, IpcServerOptions, RequestContext};
pub use service::HelperService;

use protocol::{IpcCommand, IpcErrorKind, IpcErrorPayload, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IPC channel closed")]
    ChannelClosed,

    #[error("IPC request timed out")]
    Timeout,

    #[error("IPC authentication failed")]
    AuthenticationFailed,

    #[error("too many pending IPC requests")]
    Busy,

    #[error("helper connection limit reached")]
    ConnectionLimit,

    #[error("failed to connect to helper: {0}")]
    Connect(#[source] std::io::Error),

    #[error("failed to bind helper socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] ProtocolError),

    #[error("helper error: {0}")]
    Remote(IpcErrorPayload),

    #[error("unexpected response to {0}")]
    UnexpectedResponse(IpcCommand),
}

impl IpcError {
    /// The helper is gone; nothing it might have done survives the channel
    ///
    /// A timed-out or rejected request is not unreachable: the helper may
    /// still be working on it.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::ChannelClosed)
    }
}

impl From<IpcErrorPayload> for IpcError {
    fn from(payload: IpcErrorPayload) -> Self {
        match payload.kind {
            IpcErrorKind::AuthenticationFailed => Self::AuthenticationFailed,
            IpcErrorKind::ConnectionLimit => Self::ConnectionLimit,
            IpcErrorKind::Busy => Self::Busy,
            IpcErrorKind::Timeout => Self::Timeout,
            IpcErrorKind::ChannelClosed => Self::ChannelClosed,
            _ => Self::Remote(payload),
        }
    }
}

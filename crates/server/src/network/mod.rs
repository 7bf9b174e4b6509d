//! USB/IP network front end
//!
//! ```text
//! UsbIpServer
//!   └─> ClientConnection per TCP client
//!         ├─> reader loop -> RequestProcessor
//!         └─> writer task <- reply queue
//! ```

pub mod connection;
pub mod processor;
pub mod server;

pub use connection::ClientConnection;
pub use processor::{ProcessError, RequestProcessor, Session, SessionState};
pub use server::UsbIpServer;

//! Protocol library for usbipd-rs
//!
//! This crate defines the two protocols the daemon speaks:
//!
//! - the USB/IP wire protocol used by `usbip` clients ([`usbip`]), encoded
//!   byte-exactly with big-endian fixed-width fields
//! - the IPC protocol between the daemon and its privileged helper ([`ipc`]),
//!   serialized with postcard and length-prefix framed ([`codec`])
//!
//! # Example
//!
//! ```
//! use protocol::{UsbIpCommand, decode, encode};
//!
//! let bytes = encode(&UsbIpCommand::OpReqImport { bus_id: "1-1".into() }).unwrap();
//! assert_eq!(bytes.len(), 40);
//!
//! let decoded: UsbIpCommand = decode(&bytes).unwrap();
//! assert_eq!(decoded, UsbIpCommand::OpReqImport { bus_id: "1-1".into() });
//! ```

pub mod codec;
pub mod error;
pub mod ipc;
pub mod types;
pub mod usbip;

pub use codec::{FrameResult, MAX_FRAME_SIZE, decode_frame, encode_frame};
#[cfg(feature = "async")]
pub use codec::{read_frame_async, write_frame_async};
pub use error::{ProtocolError, Result, UsbIpError};
pub use ipc::{
    ClaimHistoryEntry, ClaimRecord, HelperStatus, IpcCommand, IpcErrorKind, IpcErrorPayload,
    IpcRequest, IpcResponse, IpcResult, RequestId, params, unix_millis,
};
pub use types::{
    ClaimMethod, ClaimState, Device, DeviceKey, DeviceSpeed, InterfaceInfo, TransferKind,
};
#[cfg(feature = "async")]
pub use usbip::{StreamError, read_message, write_message};
pub use usbip::{
    CmdSubmit, CmdUnlink, Header, IsoPacketDescriptor, OpHeader, OpStatus, RetSubmit, RetUnlink,
    UrbHeader, UsbIpCommand, UsbIpReply, WireMessage, decode, decode_header, decode_prefix,
    encode, errno,
};

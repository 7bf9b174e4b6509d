//! IPC messages exchanged between the daemon and the privileged helper
//!
//! Every request carries a unique [`RequestId`]; the helper answers each
//! request with at most one [`IpcResponse`] carrying the same id. Messages are
//! serialized with postcard and framed by [`crate::codec`].

use crate::types::{ClaimMethod, ClaimState, DeviceKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Correlation id, unique per client connection
pub type RequestId = u64;

/// Parameter names understood by the helper
pub mod params {
    /// USB/IP bus id of the target device
    pub const BUS_ID: &str = "bus_id";
    pub const BUS_NUM: &str = "bus_num";
    pub const DEV_NUM: &str = "dev_num";
    /// `"true"` when re-verifying a claim restored after a restart
    pub const VERIFY: &str = "verify";
}

/// Milliseconds since the Unix epoch
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpcCommand {
    ClaimDevice,
    ReleaseDevice,
    GetClaimedDevices,
    GetStatus,
    HealthCheck,
    GetClaimHistory,
    Shutdown,
}

impl IpcCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClaimDevice => "claim-device",
            Self::ReleaseDevice => "release-device",
            Self::GetClaimedDevices => "get-claimed-devices",
            Self::GetStatus => "get-status",
            Self::HealthCheck => "health-check",
            Self::GetClaimHistory => "get-claim-history",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for IpcCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcRequest {
    /// Assigned by the sending channel; zero until sent
    pub request_id: RequestId,
    pub client_id: String,
    pub command: IpcCommand,
    pub parameters: BTreeMap<String, String>,
    pub timestamp_ms: u64,
}

impl IpcRequest {
    pub fn new(command: IpcCommand, client_id: impl Into<String>) -> Self {
        Self {
            request_id: 0,
            client_id: client_id.into(),
            command,
            parameters: BTreeMap::new(),
            timestamp_ms: unix_millis(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl ToString) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    /// Attach the identity parameters of a device
    pub fn for_device(self, key: DeviceKey, bus_id: &str) -> Self {
        self.with_param(params::BUS_ID, bus_id)
            .with_param(params::BUS_NUM, key.bus_num)
            .with_param(params::DEV_NUM, key.dev_num)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Device identity carried in `bus_num`/`dev_num`
    pub fn device_key(&self) -> Option<DeviceKey> {
        let bus_num = self.param(params::BUS_NUM)?.parse().ok()?;
        let dev_num = self.param(params::DEV_NUM)?.parse().ok()?;
        Some(DeviceKey::new(bus_num, dev_num))
    }

    pub fn is_verify(&self) -> bool {
        self.param(params::VERIFY) == Some("true")
    }
}

/// Error categories carried in failed responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpcErrorKind {
    AuthenticationFailed,
    /// Connection rejected because the helper is at its connection cap
    ConnectionLimit,
    /// Request rejected because too many requests are in flight
    Busy,
    Timeout,
    ChannelClosed,
    InvalidRequest,
    DeviceNotFound,
    DeviceAlreadyClaimed,
    DeviceNotClaimed,
    DeviceClaimFailed,
    AccessDenied,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcErrorPayload {
    pub kind: IpcErrorKind,
    pub message: String,
    /// Low-level device subsystem error code, if any
    pub code: Option<i32>,
}

impl IpcErrorPayload {
    pub fn new(kind: IpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }
}

impl fmt::Display for IpcErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{:?}: {} (code {})", self.kind, self.message, code),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// A claim as reported by the helper and persisted in the snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub key: DeviceKey,
    pub bus_id: String,
    pub method: ClaimMethod,
    pub state: ClaimState,
    pub claimed_at_ms: u64,
}

/// One state change in the claim history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimHistoryEntry {
    pub key: DeviceKey,
    pub from: Option<ClaimState>,
    pub to: ClaimState,
    pub reason: Option<String>,
    pub at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperStatus {
    pub running: bool,
    pub version: String,
    pub uptime_secs: u64,
    pub claimed_devices: u32,
    pub active_connections: u32,
}

/// Successful response payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpcResult {
    Claimed(ClaimRecord),
    Released,
    ClaimedDevices(Vec<ClaimRecord>),
    Status(HelperStatus),
    Health { uptime_secs: u64 },
    History(Vec<ClaimHistoryEntry>),
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcResponse {
    pub request_id: RequestId,
    pub success: bool,
    pub result: Option<IpcResult>,
    pub error: Option<IpcErrorPayload>,
    pub timestamp_ms: u64,
}

impl IpcResponse {
    pub fn ok(request_id: RequestId, result: IpcResult) -> Self {
        Self {
            request_id,
            success: true,
            result: Some(result),
            error: None,
            timestamp_ms: unix_millis(),
        }
    }

    pub fn err(request_id: RequestId, error: IpcErrorPayload) -> Self {
        Self {
            request_id,
            success: false,
            result: None,
            error: Some(error),
            timestamp_ms: unix_millis(),
        }
    }

    /// Split into the result or the error payload
    pub fn into_result(self) -> Result<IpcResult, IpcErrorPayload> {
        match (self.success, self.result, self.error) {
            (true, Some(result), _) => Ok(result),
            (_, _, Some(error)) => Err(error),
            _ => Err(IpcErrorPayload::new(
                IpcErrorKind::Internal,
                "response carried neither result nor error",
            )),
        }
    }
}

//! Device claiming
//!
//! A device must be claimed before it is exported. Each claim runs through a
//! small state machine ([`state`]); the [`coordinator`] picks the route (the
//! privileged helper or direct access), records history, and persists a
//! snapshot so claims can be re-verified after a restart.

pub mod coordinator;
pub mod history;
pub mod snapshot;
pub mod state;
pub mod table;

pub use coordinator::{ClaimCoordinator, DaemonStatus};
pub use history::ClaimHistory;
pub use snapshot::ClaimSnapshot;
pub use state::{ClaimEvent, ClaimStateMachine, Transition};
pub use table::{ClaimOwner, ClaimTable, ClaimedDevice};

use common::UsbFailure;
use protocol::{ClaimState, DeviceKey, IpcErrorKind, IpcErrorPayload};
use thiserror::Error;

use crate::ipc::IpcError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClaimError {
    #[error("device {0} is already claimed")]
    DeviceAlreadyClaimed(DeviceKey),

    #[error("device {0} is not claimed")]
    DeviceNotClaimed(DeviceKey),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("claim failed: {reason}")]
    DeviceClaimFailed { reason: String, code: Option<i32> },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid claim transition from {from:?} on {event}")]
    InvalidStateTransition { from: ClaimState, event: &'static str },

    #[error("claim state persistence failed: {0}")]
    Persistence(String),
}

impl ClaimError {
    pub fn claim_failed(reason: impl Into<String>, code: Option<i32>) -> Self {
        Self::DeviceClaimFailed {
            reason: reason.into(),
            code,
        }
    }

    /// Low-level device subsystem code, when one is known
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::DeviceClaimFailed { code, .. } => *code,
            Self::AccessDenied(_) => Some(UsbFailure::ACCESS),
            _ => None,
        }
    }
}

impl From<UsbFailure> for ClaimError {
    fn from(failure: UsbFailure) -> Self {
        if failure.is_access_denied() {
            Self::AccessDenied(failure.message)
        } else {
            Self::claim_failed(failure.message, Some(failure.code))
        }
    }
}

impl From<&ClaimError> for IpcErrorPayload {
    fn from(err: &ClaimError) -> Self {
        let kind = match err {
            ClaimError::DeviceAlreadyClaimed(_) => IpcErrorKind::DeviceAlreadyClaimed,
            ClaimError::DeviceNotClaimed(_) => IpcErrorKind::DeviceNotClaimed,
            ClaimError::DeviceNotFound(_) => IpcErrorKind::DeviceNotFound,
            ClaimError::DeviceClaimFailed { .. } => IpcErrorKind::DeviceClaimFailed,
            ClaimError::AccessDenied(_) => IpcErrorKind::AccessDenied,
            ClaimError::InvalidStateTransition { .. } | ClaimError::Persistence(_) => {
                IpcErrorKind::Internal
            }
        };
        let payload = IpcErrorPayload::new(kind, err.to_string());
        match err.code() {
            Some(code) => payload.with_code(code),
            None => payload,
        }
    }
}

impl ClaimError {
    /// Claim error for `key` reported by the helper
    ///
    /// Transport failures become generic claim failures; the coordinator
    /// decides separately whether they allow a direct claim.
    pub fn from_helper(key: DeviceKey, err: IpcError) -> Self {
        match err {
            IpcError::Remote(payload) => match payload.kind {
                IpcErrorKind::DeviceAlreadyClaimed => Self::DeviceAlreadyClaimed(key),
                IpcErrorKind::AccessDenied => Self::AccessDenied(payload.message),
                IpcErrorKind::DeviceNotFound => Self::DeviceNotFound(payload.message),
                _ => Self::claim_failed(payload.message, payload.code),
            },
            other => Self::claim_failed(format!("helper request failed: {}", other), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_errors_keep_their_kind() {
        let key = DeviceKey::new(1, 2);
        let busy = IpcErrorPayload::new(IpcErrorKind::DeviceAlreadyClaimed, "held");
        assert_eq!(
            ClaimError::from_helper(key, IpcError::Remote(busy)),
            ClaimError::DeviceAlreadyClaimed(key)
        );

        let denied = IpcErrorPayload::new(IpcErrorKind::AccessDenied, "no");
        assert!(matches!(
            ClaimError::from_helper(key, IpcError::Remote(denied)),
            ClaimError::AccessDenied(_)
        ));

        let failed = IpcErrorPayload::new(IpcErrorKind::DeviceClaimFailed, "io").with_code(-1);
        assert_eq!(
            ClaimError::from_helper(key, IpcError::Remote(failed)).code(),
            Some(-1)
        );

        assert!(matches!(
            ClaimError::from_helper(key, IpcError::Timeout),
            ClaimError::DeviceClaimFailed { code: None, .. }
        ));
    }
}

//! Per-device claim state machine
//!
//! ```text
//! pending --Claimed--> claimed --Released-----> released
//!    |                    \----Disconnected--> disconnected
//!    \--Failed--> failed --Retry--> pending
//! ```
//!
//! Pure state: the coordinator performs the device calls and reports their
//! outcome here as events.

use protocol::{ClaimState, unix_millis};
use std::collections::VecDeque;
use tracing::error;

use super::ClaimError;

/// Transitions kept per device; older ones live on only in the claim history
pub const MAX_TRANSITIONS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimEvent {
    Claimed,
    Failed { reason: String },
    Released,
    Disconnected,
    /// Leave `failed` for another attempt
    Retry,
}

impl ClaimEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Failed { .. } => "failed",
            Self::Released => "released",
            Self::Disconnected => "disconnected",
            Self::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ClaimState,
    pub to: ClaimState,
    pub at_ms: u64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClaimStateMachine {
    state: ClaimState,
    entered_at_ms: u64,
    transitions: VecDeque<Transition>,
}

impl ClaimStateMachine {
    /// A fresh claim attempt, in `pending`
    pub fn new() -> Self {
        Self {
            state: ClaimState::Pending,
            entered_at_ms: unix_millis(),
            transitions: VecDeque::with_capacity(4),
        }
    }

    pub fn state(&self) -> ClaimState {
        self.state
    }

    /// When the current state was entered
    pub fn entered_at_ms(&self) -> u64 {
        self.entered_at_ms
    }

    /// Most recent transitions, oldest first
    pub fn transitions(&self) -> impl ExactSizeIterator<Item = &Transition> {
        self.transitions.iter()
    }

    /// `pending` or `claimed`: the identity is taken
    pub fn is_active(&self) -> bool {
        matches!(self.state, ClaimState::Pending | ClaimState::Claimed)
    }

    pub fn apply(&mut self, event: ClaimEvent) -> Result<Transition, ClaimError> {
        use ClaimState::*;

        let next = match (self.state, &event) {
            (Pending, ClaimEvent::Claimed) => Claimed,
            (Pending, ClaimEvent::Failed { .. }) => Failed,
            (Claimed, ClaimEvent::Released) => Released,
            (Claimed, ClaimEvent::Disconnected) => Disconnected,
            (Failed, ClaimEvent::Retry) => Pending,
            (from, _) => {
                error!(
                    "Invalid claim state transition: {:?} on event '{}'",
                    from,
                    event.name()
                );
                return Err(ClaimError::InvalidStateTransition {
                    from,
                    event: event.name(),
                });
            }
        };

        let reason = match event {
            ClaimEvent::Failed { reason } => Some(reason),
            _ => None,
        };
        let transition = Transition {
            from: self.state,
            to: next,
            at_ms: unix_millis(),
            reason,
        };

        self.state = next;
        self.entered_at_ms = transition.at_ms;
        if self.transitions.len() == MAX_TRANSITIONS {
            self.transitions.pop_front();
        }
        self.transitions.push_back(transition.clone());
        Ok(transition)
    }
}

impl Default for ClaimStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

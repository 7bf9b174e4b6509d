//! Claimed-device table
//!
//! Each device identity gets its own async cell; claim and release hold only
//! that cell across their device calls. The outer map is a plain mutex held
//! just long enough to find or insert a cell, so operations on different
//! devices never wait on each other.
//!
//! Settled claims are mirrored in a small registry that listing and the
//! snapshot writer read without touching any per-device cell.

use protocol::{ClaimMethod, ClaimRecord, ClaimState, Device, DeviceKey};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

use super::state::ClaimStateMachine;
use crate::tracker::SessionId;

/// Who a claim is held for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClaimOwner {
    /// No USB/IP session (helper-side claims, direct API use)
    #[default]
    Unowned,
    /// The USB/IP session that imported the device
    Session(SessionId),
    /// Carried over from a previous run; the first import adopts it
    Restored,
}

/// A device plus the claim held on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedDevice {
    pub device: Device,
    pub method: ClaimMethod,
    pub state: ClaimState,
    pub owner: ClaimOwner,
    pub claimed_at_ms: u64,
}

impl ClaimedDevice {
    pub fn key(&self) -> DeviceKey {
        self.device.key()
    }

    /// Claims made through the privileged helper
    pub fn via_helper(&self) -> bool {
        self.method.is_privileged()
    }

    pub fn to_record(&self) -> ClaimRecord {
        ClaimRecord {
            key: self.key(),
            bus_id: self.device.bus_id.clone(),
            method: self.method.clone(),
            state: self.state,
            claimed_at_ms: self.claimed_at_ms,
        }
    }
}

/// Contents of one device's cell
#[derive(Debug)]
pub struct ClaimSlot {
    pub device: Device,
    pub machine: ClaimStateMachine,
    pub method: Option<ClaimMethod>,
    pub owner: ClaimOwner,
}

impl ClaimSlot {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            machine: ClaimStateMachine::new(),
            method: None,
            owner: ClaimOwner::Unowned,
        }
    }

    /// Snapshot of a settled claim
    pub fn claimed(&self) -> Option<ClaimedDevice> {
        let method = self.method.clone()?;
        (self.machine.state() == ClaimState::Claimed).then(|| ClaimedDevice {
            device: self.device.clone(),
            method,
            state: ClaimState::Claimed,
            owner: self.owner,
            claimed_at_ms: self.machine.entered_at_ms(),
        })
    }
}

pub type ClaimCell = Arc<AsyncMutex<Option<ClaimSlot>>>;

#[derive(Default)]
pub struct ClaimTable {
    cells: Mutex<HashMap<DeviceKey, ClaimCell>>,
    registry: Mutex<BTreeMap<DeviceKey, ClaimedDevice>>,
}

impl ClaimTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cell for `key`, created on first use
    pub fn cell(&self, key: DeviceKey) -> ClaimCell {
        self.cells
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(key)
            .or_default()
            .clone()
    }

    pub fn existing(&self, key: DeviceKey) -> Option<ClaimCell> {
        self.cells
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key)
            .cloned()
    }

    /// Record a settled claim
    pub fn publish(&self, claimed: ClaimedDevice) {
        self.registry
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(claimed.key(), claimed);
    }

    pub fn unpublish(&self, key: DeviceKey) -> Option<ClaimedDevice> {
        self.registry
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&key)
    }

    pub fn is_claimed(&self, key: DeviceKey) -> bool {
        self.registry
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&key)
    }

    pub fn owner(&self, key: DeviceKey) -> Option<ClaimOwner> {
        self.registry
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key)
            .map(|c| c.owner)
    }

    pub fn get(&self, key: DeviceKey) -> Option<ClaimedDevice> {
        self.registry
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key)
            .cloned()
    }

    /// Settled claims ordered by device key
    pub fn claimed(&self) -> Vec<ClaimedDevice> {
        self.registry
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Drop the cell for `key` if it is empty and nobody else holds it
    pub fn prune(&self, key: DeviceKey) {
        let mut cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
        let idle = cells.get(&key).is_some_and(|cell| {
            Arc::strong_count(cell) == 1 && cell.try_lock().is_ok_and(|slot| slot.is_none())
        });
        if idle {
            cells.remove(&key);
        }
    }
}

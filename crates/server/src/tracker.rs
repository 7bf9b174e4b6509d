//! In-flight URB tracking
//!
//! Every SUBMIT is registered here until it completes or is unlinked. The
//! table is shared by all connections and split into shards, each behind its
//! own short-held mutex, so transfers of unrelated connections never contend.

use protocol::{DeviceKey, TransferKind};
use std::collections::HashMap;
use std::collections::hash_map::{DefaultHasher, Entry};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;

const SHARD_COUNT: usize = 16;

/// Server-assigned id of one client connection
pub type SessionId = u64;

/// A URB is identified by its connection and the client's sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    pub session: SessionId,
    pub seqnum: u32,
}

impl TransferKey {
    pub fn new(session: SessionId, seqnum: u32) -> Self {
        Self { session, seqnum }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {} seqnum {}", self.session, self.seqnum)
    }
}

#[derive(Debug, Clone)]
pub struct PendingTransfer {
    pub key: TransferKey,
    pub device: DeviceKey,
    pub kind: TransferKind,
    pub submitted_at: Instant,
    /// Set once an UNLINK for this URB has been accepted
    pub cancelling: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("duplicate sequence number ({0})")]
    DuplicateSequenceNumber(TransferKey),

    #[error("no pending transfer for {0}")]
    NotFound(TransferKey),
}

pub struct TransferTracker {
    shards: Vec<Mutex<HashMap<TransferKey, PendingTransfer>>>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &TransferKey) -> MutexGuard<'_, HashMap<TransferKey, PendingTransfer>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        self.shards[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start tracking a submitted URB
    pub fn register(
        &self,
        key: TransferKey,
        device: DeviceKey,
        kind: TransferKind,
    ) -> Result<PendingTransfer, TrackerError> {
        match self.shard(&key).entry(key) {
            Entry::Occupied(_) => Err(TrackerError::DuplicateSequenceNumber(key)),
            Entry::Vacant(slot) => {
                let transfer = PendingTransfer {
                    key,
                    device,
                    kind,
                    submitted_at: Instant::now(),
                    cancelling: false,
                };
                slot.insert(transfer.clone());
                Ok(transfer)
            }
        }
    }

    /// Stop tracking a URB whose transfer finished
    ///
    /// The returned entry tells the caller whether an UNLINK got there first.
    pub fn complete(&self, key: TransferKey) -> Result<PendingTransfer, TrackerError> {
        self.shard(&key)
            .remove(&key)
            .ok_or(TrackerError::NotFound(key))
    }

    /// Flag a URB for cancellation; `false` if it already completed or never existed
    pub fn mark_cancelling(&self, key: TransferKey) -> bool {
        match self.shard(&key).get_mut(&key) {
            Some(transfer) => {
                transfer.cancelling = true;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: TransferKey) -> Option<PendingTransfer> {
        self.shard(&key).get(&key).cloned()
    }

    pub fn all(&self) -> Vec<PendingTransfer> {
        let mut transfers: Vec<PendingTransfer> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .values()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        transfers.sort_by_key(|t| t.key);
        transfers
    }

    /// Drop every transfer of a closed connection, returning them
    pub fn remove_session(&self, session: SessionId) -> Vec<PendingTransfer> {
        let mut removed = Vec::new();
        for shard in &self.shards {
            let mut map = shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let keys: Vec<TransferKey> = map
                .keys()
                .filter(|k| k.session == session)
                .copied()
                .collect();
            for key in keys {
                if let Some(transfer) = map.remove(&key) {
                    removed.push(transfer);
                }
            }
        }
        removed.sort_by_key(|t| t.key);
        removed
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|p| p.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TransferTracker {
    fn default() -> Self {
        Self::new()
    }
}

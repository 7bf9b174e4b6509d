//! Bounded log of claim state changes

use protocol::{ClaimHistoryEntry, ClaimState, DeviceKey, unix_millis};
use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

pub struct ClaimHistory {
    entries: Mutex<VecDeque<ClaimHistoryEntry>>,
    capacity: usize,
}

impl ClaimHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(
        &self,
        key: DeviceKey,
        from: Option<ClaimState>,
        to: ClaimState,
        reason: Option<String>,
    ) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(ClaimHistoryEntry {
            key,
            from,
            to,
            reason,
            at_ms: unix_millis(),
        });
    }

    /// Oldest first
    pub fn entries(&self) -> Vec<ClaimHistoryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for ClaimHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_drops_oldest() {
        let history = ClaimHistory::new(3);
        for dev in 1..=5 {
            history.record(DeviceKey::new(1, dev), None, ClaimState::Pending, None);
        }

        let entries = history.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key, DeviceKey::new(1, 3));
        assert_eq!(entries[2].key, DeviceKey::new(1, 5));
    }
}

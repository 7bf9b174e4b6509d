//! Claim coordinator
//!
//! Claims devices through whichever route the supervisor currently
//! publishes. On the privileged route the helper takes the device away from
//! its kernel drivers and the daemon then opens it in-process; on the
//! fallback route the daemon claims it directly with exclusive access.
//!
//! Operations on one device identity are linearized by that device's cell in
//! the [`ClaimTable`]; different devices proceed independently.
//!
//! Claims made for a USB/IP session carry its id so only that session's
//! teardown releases them. Claims restored after a crash belong to nobody
//! until the first import of the device adopts them.

use protocol::{ClaimHistoryEntry, ClaimMethod, ClaimState, Device, DeviceKey};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::history::ClaimHistory;
use super::snapshot::ClaimSnapshot;
use super::state::ClaimEvent;
use super::table::{ClaimOwner, ClaimSlot, ClaimTable, ClaimedDevice};
use super::ClaimError;
use crate::ipc::{IpcClient, IpcError};
use crate::ports::{DeviceFeed, DirectClaimer};
use crate::supervisor::{InstallationStatus, Route};
use crate::tracker::SessionId;

/// Answer to a status query
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub running: bool,
    pub route: &'static str,
    pub installation: InstallationStatus,
    pub claimed_devices: Vec<ClaimedDevice>,
}

impl DaemonStatus {
    /// One-line summary for service managers
    pub fn summary(&self) -> String {
        format!(
            "{} path, {} device(s) claimed, helper {}",
            self.route,
            self.claimed_devices.len(),
            self.installation
        )
    }
}

pub struct ClaimCoordinator {
    table: ClaimTable,
    history: ClaimHistory,
    snapshot: Option<ClaimSnapshot>,
    feed: Arc<dyn DeviceFeed>,
    direct: Arc<dyn DirectClaimer>,
    routes: watch::Receiver<Route>,
    installation: watch::Receiver<InstallationStatus>,
}

impl ClaimCoordinator {
    pub fn new(
        feed: Arc<dyn DeviceFeed>,
        direct: Arc<dyn DirectClaimer>,
        routes: watch::Receiver<Route>,
        installation: watch::Receiver<InstallationStatus>,
    ) -> Self {
        Self {
            table: ClaimTable::new(),
            history: ClaimHistory::default(),
            snapshot: None,
            feed,
            direct,
            routes,
            installation,
        }
    }

    /// Coordinator that only ever claims directly (used by the helper)
    pub fn direct_only(feed: Arc<dyn DeviceFeed>, direct: Arc<dyn DirectClaimer>) -> Self {
        let (_, routes) = watch::channel(Route::Fallback);
        let (_, installation) = watch::channel(InstallationStatus::NotAttempted);
        Self::new(feed, direct, routes, installation)
    }

    /// Persist claims to `snapshot` on every change
    pub fn with_snapshot(mut self, snapshot: ClaimSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn route(&self) -> Route {
        self.routes.borrow().clone()
    }

    pub fn feed(&self) -> &Arc<dyn DeviceFeed> {
        &self.feed
    }

    /// Claim `device` for export
    pub async fn claim(&self, device: &Device) -> Result<ClaimedDevice, ClaimError> {
        self.claim_inner(device, false, ClaimOwner::Unowned).await
    }

    /// Claim `device` on behalf of a USB/IP session
    ///
    /// A claim restored after a restart is handed to the session instead.
    pub async fn claim_for(
        &self,
        device: &Device,
        session: SessionId,
    ) -> Result<ClaimedDevice, ClaimError> {
        self.claim_inner(device, false, ClaimOwner::Session(session))
            .await
    }

    /// Confirm an existing claim on `device`, or claim it afresh
    pub async fn verify(&self, device: &Device) -> Result<ClaimedDevice, ClaimError> {
        self.claim_inner(device, true, ClaimOwner::Unowned).await
    }

    async fn claim_inner(
        &self,
        device: &Device,
        verify: bool,
        owner: ClaimOwner,
    ) -> Result<ClaimedDevice, ClaimError> {
        let key = device.key();
        let cell = self.table.cell(key);
        let mut slot = cell.lock().await;

        if let Some(existing) = slot.as_mut()
            && existing.machine.is_active()
        {
            if existing.owner == ClaimOwner::Restored
                && owner != ClaimOwner::Restored
                && let Some(mut claimed) = existing.claimed()
            {
                existing.owner = owner;
                claimed.owner = owner;
                self.table.publish(claimed.clone());
                self.history.record(
                    key,
                    Some(ClaimState::Claimed),
                    ClaimState::Claimed,
                    Some("restored claim adopted".to_string()),
                );
                info!("Restored claim on {} adopted ({:?})", key, owner);
                return Ok(claimed);
            }
            if verify && let Some(claimed) = existing.claimed() {
                debug!("Claim on {} confirmed", key);
                return Ok(claimed);
            }
            debug!("Rejecting claim on {}: already {}", key, existing.machine.state());
            return Err(ClaimError::DeviceAlreadyClaimed(key));
        }

        let mut entry = match slot.take() {
            Some(mut failed) if failed.machine.state() == ClaimState::Failed => {
                let t = failed.machine.apply(ClaimEvent::Retry)?;
                self.history
                    .record(key, Some(t.from), t.to, Some("retry".to_string()));
                failed.device = device.clone();
                failed
            }
            _ => {
                self.history.record(key, None, ClaimState::Pending, None);
                ClaimSlot::new(device.clone())
            }
        };

        match self.acquire(device, verify).await {
            Ok(method) => {
                let t = entry.machine.apply(ClaimEvent::Claimed)?;
                self.history.record(key, Some(t.from), t.to, None);
                entry.method = Some(method);
                entry.owner = owner;
                let claimed = entry
                    .claimed()
                    .ok_or_else(|| ClaimError::claim_failed("claim did not settle", None))?;
                *slot = Some(entry);
                self.table.publish(claimed.clone());
                drop(slot);

                info!(
                    "Claimed device {} ({}) via {}",
                    key, device.bus_id, claimed.method
                );
                self.persist().await;
                Ok(claimed)
            }
            Err(err) => {
                let reason = err.to_string();
                let t = entry.machine.apply(ClaimEvent::Failed {
                    reason: reason.clone(),
                })?;
                self.history.record(key, Some(t.from), t.to, Some(reason));
                *slot = Some(entry);
                warn!("Failed to claim device {} ({}): {}", key, device.bus_id, err);
                Err(err)
            }
        }
    }

    /// Take the device through the current route
    async fn acquire(&self, device: &Device, verify: bool) -> Result<ClaimMethod, ClaimError> {
        let Route::Privileged(client) = self.route() else {
            return Ok(self.direct.claim(device).await?);
        };

        let key = device.key();
        let record = match client.claim_device(device, verify).await {
            Ok(record) => record,
            Err(e) if e.is_unreachable() => {
                warn!("Helper unavailable ({}), claiming {} directly", e, key);
                return Ok(self.direct.claim(device).await?);
            }
            Err(IpcError::Timeout) => {
                // The helper may still finish the claim; its release waits for that
                warn!("Helper did not answer the claim of {} in time", key);
                Self::roll_back_helper(&client, device).await;
                return Err(ClaimError::from_helper(key, IpcError::Timeout));
            }
            Err(e) => return Err(ClaimError::from_helper(key, e)),
        };

        // The helper detached the kernel drivers; open the device here for transfers
        if let Err(failure) = self.direct.claim(device).await {
            warn!("Helper claimed {} but local open failed: {}", key, failure);
            Self::roll_back_helper(&client, device).await;
            return Err(failure.into());
        }
        Ok(record.method)
    }

    async fn roll_back_helper(client: &IpcClient, device: &Device) {
        match client.release_device(device.key(), &device.bus_id).await {
            Ok(()) => debug!("Helper claim on {} rolled back", device.key()),
            Err(e) => warn!("Failed to roll back helper claim on {}: {}", device.key(), e),
        }
    }

    /// Undo the device side of a claim; failures are logged, not returned
    async fn relinquish(&self, device: &Device, method: Option<&ClaimMethod>) {
        let key = device.key();
        if let Err(e) = self.direct.release(key).await {
            debug!("Local release of {} failed: {}", key, e);
        }

        if !method.is_some_and(ClaimMethod::is_privileged) {
            return;
        }
        match self.route() {
            Route::Privileged(client) => {
                if let Err(e) = client.release_device(key, &device.bus_id).await {
                    warn!("Helper failed to release {}: {}", key, e);
                }
            }
            Route::Fallback => {
                warn!(
                    "Helper unavailable, kernel drivers of {} stay detached until it returns",
                    key
                );
            }
        }
    }

    /// Release a claimed device, whoever holds it
    pub async fn release(&self, key: DeviceKey) -> Result<(), ClaimError> {
        self.release_inner(key, None).await
    }

    /// Release the device only if `session` still holds it
    pub async fn release_for(&self, key: DeviceKey, session: SessionId) -> Result<(), ClaimError> {
        self.release_inner(key, Some(ClaimOwner::Session(session)))
            .await
    }

    async fn release_inner(
        &self,
        key: DeviceKey,
        holder: Option<ClaimOwner>,
    ) -> Result<(), ClaimError> {
        let Some(cell) = self.table.existing(key) else {
            return Err(ClaimError::DeviceNotClaimed(key));
        };
        let mut slot = cell.lock().await;
        let Some(entry) = slot.as_mut().filter(|e| {
            e.machine.state() == ClaimState::Claimed && holder.is_none_or(|h| e.owner == h)
        }) else {
            return Err(ClaimError::DeviceNotClaimed(key));
        };

        self.relinquish(&entry.device, entry.method.as_ref()).await;
        let t = entry.machine.apply(ClaimEvent::Released)?;
        self.history.record(key, Some(t.from), t.to, None);
        *slot = None;
        self.table.unpublish(key);
        drop(slot);
        drop(cell);

        self.table.prune(key);
        info!("Released device {}", key);
        self.persist().await;
        Ok(())
    }

    /// The device was physically removed; drop its claim
    ///
    /// A later claim of the same identity starts a fresh entry.
    pub async fn mark_disconnected(&self, key: DeviceKey) -> bool {
        let Some(cell) = self.table.existing(key) else {
            return false;
        };
        let mut slot = cell.lock().await;
        let Some(entry) = slot
            .as_mut()
            .filter(|e| e.machine.state() == ClaimState::Claimed)
        else {
            return false;
        };

        match entry.machine.apply(ClaimEvent::Disconnected) {
            Ok(t) => self.history.record(
                key,
                Some(t.from),
                t.to,
                Some("device removed".to_string()),
            ),
            Err(e) => error!("Disconnect of {} not recorded: {}", key, e),
        }
        if let Err(e) = self.direct.release(key).await {
            debug!("Local release of removed device {} failed: {}", key, e);
        }
        *slot = None;
        self.table.unpublish(key);
        drop(slot);
        drop(cell);

        self.table.prune(key);
        info!("Device {} disconnected, claim dropped", key);
        self.persist().await;
        true
    }

    /// Re-verify the persisted claims of a previous run
    ///
    /// Entries whose device is gone or whose verification fails are dropped
    /// with a logged reason.
    pub async fn restore_after_restart(&self) -> Vec<ClaimedDevice> {
        let Some(snapshot) = &self.snapshot else {
            return Vec::new();
        };
        let records = match snapshot.load().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Discarding claim snapshot: {}", e);
                Vec::new()
            }
        };
        if records.is_empty() {
            self.persist().await;
            return Vec::new();
        }

        info!("Re-verifying {} persisted claims", records.len());
        let devices = self.feed.list().await;
        let mut restored = Vec::new();

        for record in &records {
            let present = devices
                .iter()
                .find(|d| d.key() == record.key && d.bus_id == record.bus_id);
            let Some(device) = present else {
                warn!(
                    "Dropping persisted claim on {} ({}): device not present",
                    record.key, record.bus_id
                );
                self.history.record(
                    record.key,
                    None,
                    ClaimState::Failed,
                    Some("not present after restart".to_string()),
                );
                continue;
            };

            match self.claim_inner(device, true, ClaimOwner::Restored).await {
                Ok(claimed) => restored.push(claimed),
                Err(e) => warn!(
                    "Dropping persisted claim on {} ({}): {}",
                    record.key, record.bus_id, e
                ),
            }
        }

        self.persist().await;
        info!(
            "Restored {} of {} persisted claims",
            restored.len(),
            records.len()
        );
        restored
    }

    /// Release restored claims that no session has adopted
    pub async fn release_unadopted(&self) -> usize {
        let mut released = 0;
        for claimed in self.table.claimed() {
            if claimed.owner != ClaimOwner::Restored {
                continue;
            }
            let key = claimed.key();
            if self.release_inner(key, Some(ClaimOwner::Restored)).await.is_ok() {
                info!(
                    "Released restored claim on {} ({}): no client re-imported it",
                    key, claimed.device.bus_id
                );
                released += 1;
            }
        }
        released
    }

    /// Re-confirm helper claims over a new helper channel
    pub async fn reverify_helper_claims(&self, client: &IpcClient) -> usize {
        let mut dropped = 0;
        for claimed in self.table.claimed().into_iter().filter(|c| c.via_helper()) {
            let key = claimed.key();
            let Some(cell) = self.table.existing(key) else {
                continue;
            };
            let mut slot = cell.lock().await;
            let Some(entry) = slot
                .as_mut()
                .filter(|e| e.machine.state() == ClaimState::Claimed)
            else {
                continue;
            };

            let Err(e) = client.claim_device(&entry.device, true).await else {
                debug!("Helper confirmed claim on {}", key);
                continue;
            };

            warn!("Dropping claim on {}: helper re-verification failed: {}", key, e);
            if let Err(release_err) = self.direct.release(key).await {
                debug!("Local release of {} failed: {}", key, release_err);
            }
            match entry.machine.apply(ClaimEvent::Released) {
                Ok(t) => self.history.record(
                    key,
                    Some(t.from),
                    t.to,
                    Some(format!("helper re-verification failed: {}", e)),
                ),
                Err(err) => error!("Drop of {} not recorded: {}", key, err),
            }
            *slot = None;
            self.table.unpublish(key);
            drop(slot);
            drop(cell);
            self.table.prune(key);
            dropped += 1;
        }

        if dropped > 0 {
            self.persist().await;
        }
        dropped
    }

    /// Re-verify helper claims whenever a new helper channel comes up
    pub fn watch_routes(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut routes = self.routes.clone();
        tokio::spawn(async move {
            let mut current = routes.borrow_and_update().clone();
            while routes.changed().await.is_ok() {
                let next = routes.borrow_and_update().clone();
                if let Route::Privileged(client) = &next
                    && !current.same_channel(&next)
                {
                    let dropped = coordinator.reverify_helper_claims(client).await;
                    if dropped > 0 {
                        warn!("{} helper claims lost across the helper restart", dropped);
                    }
                }
                current = next;
            }
        })
    }

    /// Release every claim (graceful shutdown)
    pub async fn release_all(&self) {
        for claimed in self.table.claimed() {
            if let Err(e) = self.release(claimed.key()).await {
                debug!("Release of {} during shutdown: {}", claimed.key(), e);
            }
        }
    }

    pub fn list_claimed(&self) -> Vec<ClaimedDevice> {
        self.table.claimed()
    }

    pub fn is_claimed(&self, key: DeviceKey) -> bool {
        self.table.is_claimed(key)
    }

    /// Whether `session` holds the claim on `key`
    pub fn is_held_by(&self, key: DeviceKey, session: SessionId) -> bool {
        self.table.owner(key) == Some(ClaimOwner::Session(session))
    }

    pub fn history(&self) -> Vec<ClaimHistoryEntry> {
        self.history.entries()
    }

    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            running: true,
            route: self.route().name(),
            installation: self.installation.borrow().clone(),
            claimed_devices: self.list_claimed(),
        }
    }

    async fn persist(&self) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        let result = snapshot
            .save_with(|| {
                self.table
                    .claimed()
                    .iter()
                    .map(ClaimedDevice::to_record)
                    .collect()
            })
            .await;
        if let Err(e) = result {
            warn!("Failed to persist claims: {}", e);
        }
    }
}

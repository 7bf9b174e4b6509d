//! USB/IP request processing
//!
//! One [`Session`] per client connection. Devlist and import run before a
//! device is imported; afterwards the connection carries only URB traffic.
//! SUBMITs run as their own tasks so an UNLINK is never stuck behind the
//! transfer it wants to cancel.

use protocol::{
    CmdSubmit, CmdUnlink, Device, OpStatus, RetSubmit, RetUnlink, UsbIpCommand, UsbIpReply,
    errno,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::claim::{ClaimCoordinator, ClaimError};
use crate::ports::{TransferExecutor, TransferRequest};
use crate::tracker::{SessionId, TransferKey, TransferTracker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingCommand,
    Imported { device: Device },
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: SessionState,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::AwaitingCommand,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn imported(&self) -> Option<&Device> {
        match &self.state {
            SessionState::Imported { device } => Some(device),
            SessionState::AwaitingCommand => None,
        }
    }
}

/// Protocol violations; the connection is closed after any of these
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("{0} received before a device was imported")]
    NotImported(&'static str),

    #[error("{command} received after importing {bus_id}")]
    AlreadyImported {
        command: &'static str,
        bus_id: String,
    },

    #[error("reply channel closed")]
    ReplyChannelClosed,
}

/// OP_REP_IMPORT status for a failed claim
pub fn import_status(err: &ClaimError) -> OpStatus {
    match err {
        ClaimError::DeviceNotFound(_) => OpStatus::NoDev,
        ClaimError::DeviceAlreadyClaimed(_) => OpStatus::DevBusy,
        ClaimError::AccessDenied(_) => OpStatus::Na,
        _ => OpStatus::DevErr,
    }
}

pub struct RequestProcessor {
    coordinator: Arc<ClaimCoordinator>,
    tracker: Arc<TransferTracker>,
    executor: Arc<dyn TransferExecutor>,
}

impl RequestProcessor {
    pub fn new(
        coordinator: Arc<ClaimCoordinator>,
        tracker: Arc<TransferTracker>,
        executor: Arc<dyn TransferExecutor>,
    ) -> Self {
        Self {
            coordinator,
            tracker,
            executor,
        }
    }

    pub fn tracker(&self) -> &Arc<TransferTracker> {
        &self.tracker
    }

    /// Handle one command; replies go to `out`
    pub async fn process(
        &self,
        session: &mut Session,
        command: UsbIpCommand,
        out: &mpsc::Sender<UsbIpReply>,
    ) -> Result<(), ProcessError> {
        match command {
            UsbIpCommand::OpReqDevlist => {
                if let Some(device) = session.imported() {
                    return Err(ProcessError::AlreadyImported {
                        command: "OP_REQ_DEVLIST",
                        bus_id: device.bus_id.clone(),
                    });
                }
                let devices = self.coordinator.feed().list().await;
                debug!("Session {}: listing {} devices", session.id, devices.len());
                send(out, UsbIpReply::devlist(&devices)).await
            }
            UsbIpCommand::OpReqImport { bus_id } => self.import(session, &bus_id, out).await,
            UsbIpCommand::CmdSubmit(submit) => self.submit(session, submit, out).await,
            UsbIpCommand::CmdUnlink(unlink) => self.unlink(session, unlink, out).await,
        }
    }

    async fn import(
        &self,
        session: &mut Session,
        bus_id: &str,
        out: &mpsc::Sender<UsbIpReply>,
    ) -> Result<(), ProcessError> {
        if let Some(device) = session.imported() {
            return Err(ProcessError::AlreadyImported {
                command: "OP_REQ_IMPORT",
                bus_id: device.bus_id.clone(),
            });
        }

        let Some(device) = self.coordinator.feed().find(bus_id).await else {
            info!("Session {}: import of unknown bus id {}", session.id, bus_id);
            return send(out, UsbIpReply::import_failed(OpStatus::NoDev)).await;
        };

        match self.coordinator.claim_for(&device, session.id).await {
            Ok(claimed) => {
                info!(
                    "Session {}: imported {} ({}) via {}",
                    session.id,
                    bus_id,
                    device.key(),
                    claimed.method
                );
                let reply = UsbIpReply::import_ok(&device);
                session.state = SessionState::Imported { device };
                send(out, reply).await
            }
            Err(e) => {
                let status = import_status(&e);
                info!(
                    "Session {}: import of {} refused ({:?}): {}",
                    session.id, bus_id, status, e
                );
                send(out, UsbIpReply::import_failed(status)).await
            }
        }
    }

    async fn submit(
        &self,
        session: &Session,
        submit: CmdSubmit,
        out: &mpsc::Sender<UsbIpReply>,
    ) -> Result<(), ProcessError> {
        let device = session
            .imported()
            .ok_or(ProcessError::NotImported("USBIP_CMD_SUBMIT"))?;
        let header = submit.header;
        let device_key = device.key();

        if header.devid != device.devid() || !self.coordinator.is_held_by(device_key, session.id) {
            debug!(
                "Session {}: SUBMIT {} for devid {:#x} not held by this session",
                session.id, header.seqnum, header.devid
            );
            return send(
                out,
                UsbIpReply::RetSubmit(RetSubmit::error(&header, errno::ENODEV)),
            )
            .await;
        }

        let key = TransferKey::new(session.id, header.seqnum);
        if let Err(e) = self
            .tracker
            .register(key, device_key, submit.transfer_kind())
        {
            warn!("Session {}: {}", session.id, e);
            return send(
                out,
                UsbIpReply::RetSubmit(RetSubmit::error(&header, errno::EINVAL)),
            )
            .await;
        }

        let request = TransferRequest::from_submit(key, device_key, &submit);
        let tracker = Arc::clone(&self.tracker);
        let executor = Arc::clone(&self.executor);
        let out = out.clone();
        tokio::spawn(async move {
            let outcome = executor.execute(request).await;
            match tracker.complete(key) {
                Ok(transfer) if transfer.cancelling => {
                    debug!("{} was unlinked, dropping its RET_SUBMIT", key);
                }
                Ok(_) => {
                    let reply = RetSubmit::reply_to(
                        &header,
                        outcome.status,
                        outcome.actual_length,
                        outcome.data,
                    );
                    let _ = out.send(UsbIpReply::RetSubmit(reply)).await;
                }
                // Session closed while the transfer ran
                Err(_) => debug!("{} finished after its session closed", key),
            }
        });
        Ok(())
    }

    async fn unlink(
        &self,
        session: &Session,
        unlink: CmdUnlink,
        out: &mpsc::Sender<UsbIpReply>,
    ) -> Result<(), ProcessError> {
        if session.imported().is_none() {
            return Err(ProcessError::NotImported("USBIP_CMD_UNLINK"));
        }

        let key = TransferKey::new(session.id, unlink.unlink_seqnum);
        let status = if self.tracker.mark_cancelling(key) {
            let queued = self.executor.cancel(key).await;
            debug!("Unlinking {} (still queued: {})", key, queued);
            -errno::ECONNRESET
        } else {
            // Already completed (or never seen); not an error
            debug!("UNLINK for {} found nothing pending", key);
            0
        };

        send(
            out,
            UsbIpReply::RetUnlink(RetUnlink::reply_to(&unlink.header, status)),
        )
        .await
    }

    /// Tear down a finished connection: cancel its transfers, release its device
    pub async fn close_session(&self, session: Session) {
        let orphaned = self.tracker.remove_session(session.id);
        if !orphaned.is_empty() {
            debug!(
                "Session {}: cancelling {} pending transfers",
                session.id,
                orphaned.len()
            );
        }
        for transfer in &orphaned {
            self.executor.cancel(transfer.key).await;
        }

        if let SessionState::Imported { device } = session.state {
            match self.coordinator.release_for(device.key(), session.id).await {
                Ok(()) => info!(
                    "Session {}: released {} ({})",
                    session.id,
                    device.bus_id,
                    device.key()
                ),
                Err(e) => debug!("Session {}: release of {}: {}", session.id, device.key(), e),
            }
        }
    }
}

async fn send(out: &mpsc::Sender<UsbIpReply>, reply: UsbIpReply) -> Result<(), ProcessError> {
    out.send(reply)
        .await
        .map_err(|_| ProcessError::ReplyChannelClosed)
}

//! USB worker thread
//!
//! libusb calls block, so every one of them runs here. The loop alternates
//! between draining commands from the Tokio side and pumping libusb events.

use crate::usb::{manager::DeviceManager, transfers};
use common::{TransferOutcome, UsbCommand, UsbTransfer, UsbWorker};
use protocol::{TransferKind, errno};
use rusb::UsbContext;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one `handle_events` call may block before commands are checked again
const EVENT_POLL: Duration = Duration::from_millis(100);

pub struct UsbWorkerThread {
    manager: DeviceManager,
    worker: UsbWorker,
    transfer_timeout: Duration,
}

impl UsbWorkerThread {
    pub fn new(
        worker: UsbWorker,
        filters: Vec<String>,
        transfer_timeout: Duration,
    ) -> Result<Self, rusb::Error> {
        let mut manager = DeviceManager::new(worker.event_tx.clone(), filters)?;
        manager.initialize()?;

        Ok(Self {
            manager,
            worker,
            transfer_timeout,
        })
    }

    /// Run until a `Shutdown` command arrives
    pub fn run(mut self) -> Result<(), rusb::Error> {
        info!("USB worker thread started");

        loop {
            while let Some(cmd) = self.worker.try_recv_command() {
                if matches!(cmd, UsbCommand::Shutdown) {
                    info!("USB worker shutting down");
                    self.manager.release_all();
                    info!("USB worker thread stopped");
                    return Ok(());
                }
                self.handle_command(cmd);
            }

            match self.manager.context().handle_events(Some(EVENT_POLL)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => debug!("USB event handling interrupted"),
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_POLL);
                }
            }

            self.manager.process_hotplug();
        }
    }

    fn handle_command(&mut self, cmd: UsbCommand) {
        // A panic in one command must not take the thread (and every device) down
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::ListDevices { response } => {
                let devices = self.manager.list_devices();
                debug!("Listing {} devices", devices.len());
                let _ = response.send(devices);
            }

            UsbCommand::ClaimDevice {
                key,
                mode,
                response,
            } => {
                debug!("Claiming device {} ({:?})", key, mode);
                let _ = response.send(self.manager.claim(key, mode));
            }

            UsbCommand::ReleaseDevice { key, response } => {
                debug!("Releasing device {}", key);
                let _ = response.send(self.manager.release(key));
            }

            UsbCommand::Execute { transfer, response } => {
                let _ = response.send(self.execute(&transfer));
            }

            UsbCommand::Shutdown => {}
        }
    }

    fn execute(&mut self, transfer: &UsbTransfer) -> TransferOutcome {
        if transfer.is_cancelled() {
            debug!("Skipping unlinked transfer on {}", transfer.key);
            return TransferOutcome::failed(errno::ECONNRESET);
        }
        if transfer.kind == TransferKind::Isochronous {
            return TransferOutcome::failed(errno::EOPNOTSUPP);
        }

        let timeout = self.transfer_timeout;
        match self
            .manager
            .device_mut(transfer.key)
            .and_then(|device| device.handle_mut())
        {
            Some(handle) => transfers::execute(handle, transfer, timeout),
            None => {
                warn!("Transfer for {} which is not open", transfer.key);
                TransferOutcome::failed(errno::ENODEV)
            }
        }
    }
}

/// Spawn the USB worker on its own OS thread
pub fn spawn_usb_worker(
    worker: UsbWorker,
    filters: Vec<String>,
    transfer_timeout: Duration,
) -> std::io::Result<std::thread::JoinHandle<Result<(), rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            let worker_thread = UsbWorkerThread::new(worker, filters, transfer_timeout)?;
            worker_thread.run()
        })
}

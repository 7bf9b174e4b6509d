//! usbipd-helper
//!
//! Privileged companion of `usbipd`. Listens on a Unix socket and claims
//! devices for the daemon by detaching their kernel drivers, which the
//! unprivileged daemon cannot do itself.

use anyhow::{Context, Result};
use clap::Parser;
use common::{ClaimMode, UsbCommand, create_usb_bridge, setup_logging};
use server::claim::ClaimCoordinator;
use server::config::ServerConfig;
use server::ipc::{HelperService, IpcServer, IpcServerOptions};
use server::usb::{UsbBackend, forward_disconnects, spawn_usb_worker};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "usbipd-helper")]
#[command(author, version, about = "Privileged device-claim helper for usbipd")]
struct Args {
    /// Path to configuration file (shared with usbipd)
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ServerConfig::load(Some(path.clone())).context("Failed to load configuration")?,
        None => ServerConfig::load_or_default(),
    };
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbipd-helper v{}", env!("CARGO_PKG_VERSION"));

    let (usb_bridge, worker) = create_usb_bridge();
    let usb_worker_handle = spawn_usb_worker(
        worker,
        config.usb.filters.clone(),
        config.usb.transfer_timeout(),
    )
    .context("Failed to spawn USB worker thread")?;

    let backend = Arc::new(UsbBackend::new(
        usb_bridge.clone(),
        ClaimMode::DetachKernelDrivers,
    ));
    let coordinator = Arc::new(ClaimCoordinator::direct_only(backend.clone(), backend));
    let events = tokio::spawn(forward_disconnects(usb_bridge.clone(), coordinator.clone()));

    let ipc = IpcServer::start(
        IpcServerOptions::from(&config.ipc),
        Arc::new(HelperService::new(coordinator.clone())),
    )
    .await
    .context("Failed to start helper IPC server")?;

    tokio::select! {
        _ = ipc.stopped() => info!("Shutdown requested by the daemon"),
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Error waiting for Ctrl+C: {}", e),
        },
    }

    ipc.stop().await;
    events.abort();
    // Hand every device back to its kernel drivers
    coordinator.release_all().await;

    if let Err(e) = usb_bridge.send_command(UsbCommand::Shutdown).await {
        error!("Error shutting down USB worker: {:#}", e);
    }
    match usb_worker_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("USB worker failed: {}", e),
        Err(e) => error!("USB worker thread panicked: {:?}", e),
    }

    info!("Helper stopped");
    Ok(())
}

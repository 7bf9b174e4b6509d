//! usbipd
//!
//! Exports local USB devices to USB/IP clients over TCP. Devices are claimed
//! through the privileged helper when one is installed, and directly
//! otherwise.

use anyhow::{Context, Result};
use clap::Parser;
use common::{ClaimMode, UsbBridge, UsbCommand, create_usb_bridge, setup_logging};
use server::claim::{ClaimCoordinator, ClaimSnapshot};
use server::config::ServerConfig;
use server::network::{RequestProcessor, UsbIpServer};
use server::ports::DeviceFeed;
use server::service;
use server::supervisor::{ProcessInstaller, Supervisor, SupervisorOptions};
use server::tracker::TransferTracker;
use server::usb::{UsbBackend, forward_disconnects, spawn_usb_worker};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

/// How often the systemd status line is refreshed
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "usbipd")]
#[command(author, version, about = "USB/IP server daemon")]
#[command(long_about = "
Exports local USB devices to USB/IP clients (usbip attach) over TCP.

EXAMPLES:
    # Run with default config
    usbipd

    # Run with custom config
    usbipd --config /path/to/server.toml

    # List exportable USB devices without starting the server
    usbipd --list-devices

    # Run as systemd service
    usbipd --service

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbipd/server.toml
    3. /etc/usbipd/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Run as systemd service (sd-notify readiness and watchdog)
    #[arg(long)]
    service: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ServerConfig::default();
        let path = ServerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => ServerConfig::load(Some(path.clone())).context("Failed to load configuration")?,
        None => ServerConfig::load_or_default(),
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbipd v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let (usb_bridge, worker) = create_usb_bridge();
    let usb_worker_handle = spawn_usb_worker(
        worker,
        config.usb.filters.clone(),
        config.usb.transfer_timeout(),
    )
    .context("Failed to spawn USB worker thread")?;
    let backend = Arc::new(UsbBackend::new(usb_bridge.clone(), ClaimMode::Exclusive));

    let result = if args.list_devices {
        list_devices_mode(&backend).await
    } else {
        let service_mode = args.service || config.server.service_mode;
        run_daemon(config, backend, service_mode).await
    };

    info!("Shutting down USB subsystem...");
    if let Err(e) = shutdown_usb_worker(&usb_bridge).await {
        error!("Error shutting down USB worker: {:#}", e);
    }
    match usb_worker_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("USB worker failed: {}", e),
        Err(e) => error!("USB worker thread panicked: {:?}", e),
    }

    result
}

/// List exportable USB devices and exit
async fn list_devices_mode(backend: &UsbBackend) -> Result<()> {
    let devices = backend.list().await;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {:<10} {:04x}:{:04x} - {} {}",
            device.bus_id,
            device.vendor_id,
            device.product_id,
            device
                .manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            device.product.as_deref().unwrap_or("Unknown Product")
        );
        println!(
            "      Bus {:03} Device {:03} Speed: {:?}",
            device.bus_num, device.dev_num, device.speed
        );
        if let Some(serial) = &device.serial_number {
            println!("      Serial: {}", serial);
        }
        println!();
    }
    Ok(())
}

async fn run_daemon(
    config: ServerConfig,
    backend: Arc<UsbBackend>,
    service_mode: bool,
) -> Result<()> {
    let supervisor = Supervisor::new(
        SupervisorOptions::from_config(&config),
        Arc::new(ProcessInstaller::from_settings(&config.helper)),
    );
    let coordinator = Arc::new(
        ClaimCoordinator::new(
            backend.clone(),
            backend.clone(),
            supervisor.routes(),
            supervisor.installation(),
        )
        .with_snapshot(ClaimSnapshot::new(config.state.claims_path())),
    );

    supervisor.start().await;
    let route_watch = coordinator.watch_routes();
    let restorer = tokio::spawn(restore_claims(
        coordinator.clone(),
        supervisor.clone(),
        config.state.restore_grace(),
    ));

    let events = tokio::spawn(forward_disconnects(
        backend.bridge().clone(),
        coordinator.clone(),
    ));

    let processor = Arc::new(RequestProcessor::new(
        coordinator.clone(),
        Arc::new(TransferTracker::new()),
        backend.clone(),
    ));
    let server = UsbIpServer::bind(
        &config.server.bind_addr,
        config.server.max_connections,
        processor,
    )
    .await?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Server error: {:#}", e);
        }
    });

    let mut service_tasks = Vec::new();
    if service_mode {
        if service::is_systemd() {
            info!("Running under systemd");
        }
        service_tasks.extend(service::spawn_watchdog_task());
        service::notify_ready().context("Failed to notify systemd ready")?;

        let status_source = coordinator.clone();
        service_tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = service::notify_status(&status_source.status().summary()) {
                    error!("Failed to send status to systemd: {:#}", e);
                }
            }
        }));
    }

    info!("{}", coordinator.status().summary());
    info!("Press Ctrl+C to shutdown");

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    if service_mode {
        service::notify_stopping().context("Failed to notify systemd stopping")?;
    }
    for task in service_tasks {
        task.abort();
    }
    server_handle.abort();
    events.abort();
    route_watch.abort();
    restorer.abort();

    // A graceful stop gives every device back; only a crash leaves claims to restore
    coordinator.release_all().await;
    supervisor.stop().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Restore the previous run's claims once the helper route is known
///
/// Restored claims wait `grace` for their client to import them again and
/// are released afterwards.
async fn restore_claims(
    coordinator: Arc<ClaimCoordinator>,
    supervisor: Arc<Supervisor>,
    grace: Duration,
) {
    supervisor.settled().await;
    let restored = coordinator.restore_after_restart().await;
    if restored.is_empty() {
        return;
    }
    info!(
        "{} claims survived the restart, holding them for {}s",
        restored.len(),
        grace.as_secs()
    );

    tokio::time::sleep(grace).await;
    let released = coordinator.release_unadopted().await;
    if released > 0 {
        info!("Released {} restored claims nobody re-imported", released);
    }
}

async fn shutdown_usb_worker(usb_bridge: &UsbBridge) -> Result<()> {
    usb_bridge
        .send_command(UsbCommand::Shutdown)
        .await
        .context("Failed to send Shutdown command")?;
    Ok(())
}

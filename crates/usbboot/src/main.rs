//! usbboot daemon
//!
//! Watches the USB bus for Compute Modules waiting in the boot ROM and boots
//! them from a firmware directory. Every device snapshot is printed to stdout
//! as one JSON line; logs go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};
use usbboot::adapter::UsbbootAdapter;
use usbboot::boot::DirectoryProvider;
use usbboot::service::{self, ServiceState};
use usbboot::usb::{RusbTransport, UsbChannel, UsbDevice, UsbTransport};
use usbboot::{Scanner, ScannerEvent, UsbbootConfig};

#[derive(Parser, Debug)]
#[command(name = "usbboot-daemon")]
#[command(
    author,
    version,
    about = "Boot Raspberry Pi Compute Modules over USB"
)]
#[command(long_about = "
Boots Raspberry Pi Compute Modules attached over USB so that their eMMC
shows up as a regular mass storage device.

EXAMPLES:
    # Run with default config
    usbboot-daemon

    # Serve firmware from a specific directory
    usbboot-daemon --firmware-dir ~/usbboot/msd

    # List usbboot-capable devices and exit
    usbboot-daemon --list-devices

    # Run with debug logging
    usbboot-daemon --log-level debug

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbboot/usbboot.toml
    3. /etc/usbboot/usbboot.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Directory holding bootcode.bin and the second-stage files
    #[arg(short, long, value_name = "DIR")]
    firmware_dir: Option<PathBuf>,

    /// List usbboot-capable devices and exit
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
        let config = UsbbootConfig::default();
        let path = UsbbootConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        UsbbootConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        UsbbootConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbboot daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let transport = Arc::new(RusbTransport::new());

    if args.list_devices {
        return list_devices_mode(&config, transport).await;
    }

    let firmware_dir = args.firmware_dir.clone().unwrap_or_else(|| config.firmware_dir());
    run(config, transport, firmware_dir).await
}

/// Print usbboot-capable devices and exit
async fn list_devices_mode(config: &UsbbootConfig, transport: Arc<RusbTransport>) -> Result<()> {
    let options = config.usbboot_options()?;
    let identities: Vec<_> = protocol::USBBOOT_CAPABLE_DEVICES
        .iter()
        .copied()
        .chain(options.extra_identities)
        .collect();

    let capable = tokio::task::spawn_blocking(move || {
        transport
            .list_devices()
            .into_iter()
            .filter(|d| identities.contains(&d.descriptor.identity()))
            .map(|d| {
                let description = describe(transport.as_ref(), &d);
                (d, description)
            })
            .collect::<Vec<_>>()
    })
    .await
    .context("Device enumeration task failed")?;

    if capable.is_empty() {
        println!("No usbboot-capable devices found.");
        return Ok(());
    }

    println!("Found {} usbboot-capable device(s):\n", capable.len());
    for (device, description) in capable {
        let stage = if device.descriptor.needs_bootcode() {
            "boot ROM"
        } else {
            "second stage"
        };
        println!(
            "  [{}] {} - {} ({})",
            device.raw_handle(),
            device.descriptor.identity(),
            description,
            stage
        );
        println!(
            "      Bus {:03} Device {:03} Interfaces: {}",
            device.bus_number, device.device_address, device.descriptor.interface_count
        );
    }

    Ok(())
}

/// The device's own strings, or a generic label if it cannot be opened
fn describe(transport: &RusbTransport, device: &UsbDevice) -> String {
    let name = transport
        .open(device)
        .and_then(|mut channel| channel.read_device_name());
    let description = match name {
        Ok(name) => name.description(),
        Err(e) => {
            debug!("Could not read strings of {}: {}", device.raw_handle(), e);
            None
        }
    };
    description.unwrap_or_else(|| "Compute Module".to_string())
}

/// Scan until Ctrl+C, printing each new snapshot
async fn run(
    config: UsbbootConfig,
    transport: Arc<RusbTransport>,
    firmware_dir: PathBuf,
) -> Result<()> {
    if !firmware_dir.is_dir() {
        warn!(
            "Firmware directory {} does not exist, devices will not boot",
            firmware_dir.display()
        );
    }
    info!("Serving firmware from {}", firmware_dir.display());

    let options = config.usbboot_options()?;
    let adapter = UsbbootAdapter::new(
        transport,
        Arc::new(DirectoryProvider::new(firmware_dir)),
        options,
    );

    let mut scanner = Scanner::with_scan_delay(config.scan_delay());
    scanner
        .subscribe(Arc::new(adapter))
        .context("Failed to subscribe usbboot adapter")?;
    let events = scanner.events();
    scanner.start();

    service::notify(ServiceState::Ready).context("Failed to notify systemd ready")?;
    info!("Press Ctrl+C to shutdown");

    let mut last_snapshot = String::new();
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
            event = events.recv() => {
                let Ok(event) = event else {
                    warn!("Scanner event channel closed");
                    break;
                };
                match event {
                    ScannerEvent::Devices(records) => {
                        let snapshot = serde_json::to_string(&records)
                            .context("Failed to serialize device snapshot")?;
                        if snapshot != last_snapshot {
                            println!("{}", snapshot);
                            let status = service::devices_status(records.len());
                            if let Err(e) = service::notify(status) {
                                debug!("Failed to send status to systemd: {:#}", e);
                            }
                            last_snapshot = snapshot;
                        }
                    }
                    ScannerEvent::Error(e) => error!("{}", e),
                    other => debug!("Scanner event: {:?}", other),
                }
            }
        }
    }

    service::notify(ServiceState::Stopping).context("Failed to notify systemd stopping")?;
    scanner.stop();

    info!("Shutdown complete");
    Ok(())
}

//! USB device manager
//!
//! Owns the libusb context and the registry of exportable devices. Runs on
//! the worker thread only.

use crate::usb::device::UsbDevice;
use crate::usb::transfers::usb_failure;
use common::{ClaimMode, UsbEvent, UsbFailure};
use protocol::{ClaimMethod, Device, DeviceKey};
use rusb::{Context, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Root hubs (Linux Foundation, hub class) are never exported
const ROOT_HUB_VENDOR: u16 = 0x1d6b;
const HUB_CLASS: u8 = 0x09;

enum HotplugNotice {
    Arrived(rusb::Device<Context>),
    Left { bus: u8, address: u8 },
}

pub struct DeviceManager {
    context: Context,
    devices: BTreeMap<(u8, u8), UsbDevice>,
    /// VID:PID patterns; empty exports everything
    filters: Vec<String>,
    event_sender: async_channel::Sender<UsbEvent>,
    hotplug_tx: mpsc::Sender<HotplugNotice>,
    hotplug_rx: mpsc::Receiver<HotplugNotice>,
    _hotplug_registration: Option<Registration<Context>>,
}

impl DeviceManager {
    pub fn new(
        event_sender: async_channel::Sender<UsbEvent>,
        filters: Vec<String>,
    ) -> Result<Self, rusb::Error> {
        let (hotplug_tx, hotplug_rx) = mpsc::channel();
        Ok(Self {
            context: Context::new()?,
            devices: BTreeMap::new(),
            filters,
            event_sender,
            hotplug_tx,
            hotplug_rx,
            _hotplug_registration: None,
        })
    }

    /// Enumerate attached devices and subscribe to hot-plug notifications
    pub fn initialize(&mut self) -> Result<(), rusb::Error> {
        self.rescan()?;

        if rusb::has_hotplug() {
            let callback = HotplugCallback {
                notices: self.hotplug_tx.clone(),
            };
            let registration = HotplugBuilder::new()
                .enumerate(false)
                .register(&self.context, Box::new(callback))?;
            self._hotplug_registration = Some(registration);
            debug!("Hot-plug callbacks registered");
        } else {
            info!("libusb has no hot-plug support, devices are rescanned on every listing");
        }

        info!("Device manager initialized with {} devices", self.devices.len());
        Ok(())
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Current exportable devices, rescanning the bus first
    pub fn list_devices(&mut self) -> Vec<Device> {
        if let Err(e) = self.rescan() {
            warn!("USB rescan failed: {}", e);
        }
        self.devices.values().map(UsbDevice::to_device).collect()
    }

    /// Sync the registry with the bus; vanished devices emit `DeviceLeft`
    fn rescan(&mut self) -> Result<(), rusb::Error> {
        let mut present = BTreeSet::new();
        for device in self.context.devices()?.iter() {
            present.insert((device.bus_number(), device.address()));
            self.add_device(device);
        }

        let gone: Vec<(u8, u8)> = self
            .devices
            .keys()
            .filter(|slot| !present.contains(slot))
            .copied()
            .collect();
        for (bus, address) in gone {
            self.handle_device_left(bus, address);
        }
        Ok(())
    }

    /// Register `device` if it is exportable; returns whether it is new
    fn add_device(&mut self, device: rusb::Device<Context>) -> bool {
        let slot = (device.bus_number(), device.address());
        if self.devices.contains_key(&slot) {
            return false;
        }

        let usb_device = match UsbDevice::new(device) {
            Ok(d) => d,
            Err(e) => {
                debug!("Skipping {}:{}: {}", slot.0, slot.1, e);
                return false;
            }
        };
        let desc = usb_device.descriptor();
        if desc.vendor_id() == ROOT_HUB_VENDOR && desc.class_code() == HUB_CLASS {
            return false;
        }
        if !check_filter(desc.vendor_id(), desc.product_id(), &self.filters) {
            debug!(
                "Device {:04x}:{:04x} at {} excluded by filter",
                desc.vendor_id(),
                desc.product_id(),
                usb_device.bus_id()
            );
            return false;
        }

        debug!(
            "Added device {} ({}) {:04x}:{:04x}",
            usb_device.key(),
            usb_device.bus_id(),
            desc.vendor_id(),
            desc.product_id()
        );
        self.devices.insert(slot, usb_device);
        true
    }

    fn handle_device_arrived(&mut self, device: rusb::Device<Context>) {
        let slot = (device.bus_number(), device.address());
        if !self.add_device(device) {
            return;
        }
        if let Some(usb_device) = self.devices.get(&slot) {
            let event = UsbEvent::DeviceArrived {
                device: usb_device.to_device(),
            };
            if let Err(e) = self.event_sender.send_blocking(event) {
                error!("Failed to send DeviceArrived event: {}", e);
            }
        }
    }

    fn handle_device_left(&mut self, bus: u8, address: u8) {
        let Some(mut device) = self.devices.remove(&(bus, address)) else {
            return;
        };
        let key = device.key();
        if device.is_open() {
            let _ = device.release();
        }
        debug!("Device {} ({}) left", key, device.bus_id());
        if let Err(e) = self.event_sender.send_blocking(UsbEvent::DeviceLeft { key }) {
            error!("Failed to send DeviceLeft event: {}", e);
        }
    }

    /// Apply hot-plug notifications queued by the libusb callback
    pub fn process_hotplug(&mut self) {
        while let Ok(notice) = self.hotplug_rx.try_recv() {
            match notice {
                HotplugNotice::Arrived(device) => self.handle_device_arrived(device),
                HotplugNotice::Left { bus, address } => self.handle_device_left(bus, address),
            }
        }
    }

    pub fn device_mut(&mut self, key: DeviceKey) -> Option<&mut UsbDevice> {
        let bus = u8::try_from(key.bus_num).ok()?;
        let address = u8::try_from(key.dev_num).ok()?;
        self.devices.get_mut(&(bus, address))
    }

    pub fn claim(&mut self, key: DeviceKey, mode: ClaimMode) -> Result<ClaimMethod, UsbFailure> {
        let device = self.device_mut(key).ok_or_else(|| {
            UsbFailure::new(UsbFailure::NOT_FOUND, format!("device {} not attached", key))
        })?;
        device.claim(mode).map_err(usb_failure)
    }

    pub fn release(&mut self, key: DeviceKey) -> Result<(), UsbFailure> {
        let device = self.device_mut(key).ok_or_else(|| {
            UsbFailure::new(UsbFailure::NOT_FOUND, format!("device {} not attached", key))
        })?;
        device.release().map_err(usb_failure)
    }

    /// Release every open device (worker shutdown)
    pub fn release_all(&mut self) {
        for device in self.devices.values_mut().filter(|d| d.is_open()) {
            if let Err(e) = device.release() {
                warn!("Failed to release {} on shutdown: {}", device.key(), e);
            }
        }
    }
}

/// Whether a VID/PID pair passes the configured filters
///
/// Filters look like `0x1234:0x5678` or `0x1234:*`; `*` matches anything.
pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    let matches = |pattern: &str, value: u16| {
        pattern == "*"
            || u16::from_str_radix(pattern.trim_start_matches("0x"), 16)
                .is_ok_and(|p| p == value)
    };

    filters.iter().any(|filter| match filter.split_once(':') {
        Some((vid_pattern, pid_pattern)) => {
            matches(vid_pattern, vid) && matches(pid_pattern, pid)
        }
        None => false,
    })
}

/// Forwards libusb hot-plug callbacks to the worker loop
///
/// The callback fires inside `handle_events`, where the manager is already
/// borrowed, so notices are queued and applied by [`DeviceManager::process_hotplug`].
struct HotplugCallback {
    notices: mpsc::Sender<HotplugNotice>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: rusb::Device<Context>) {
        debug!(
            "Hot-plug: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.notices.send(HotplugNotice::Arrived(device));
    }

    fn device_left(&mut self, device: rusb::Device<Context>) {
        debug!(
            "Hot-plug: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.notices.send(HotplugNotice::Left {
            bus: device.bus_number(),
            address: device.address(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters = vec!["0x1234:0x5678".to_string(), "0xABCD:*".to_string()];

        assert!(check_filter(0x1234, 0x5678, &filters));
        assert!(check_filter(0xABCD, 0x1111, &filters));
        assert!(!check_filter(0x1234, 0x9999, &filters));
        assert!(!check_filter(0x9999, 0x5678, &filters));

        assert!(check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_malformed_filter_matches_nothing() {
        let filters = vec!["1234".to_string(), "*:zz".to_string()];
        assert!(!check_filter(0x1234, 0x0001, &filters));
    }
}

//! USB device wrapper
//!
//! Caches the descriptor of one attached device, converts it to the exported
//! [`protocol::Device`] shape, and owns the open handle while the device is
//! claimed.

use common::ClaimMode;
use protocol::{ClaimMethod, Device, DeviceKey, DeviceSpeed, InterfaceInfo};
use rusb::{Context, DeviceDescriptor, DeviceHandle};
use tracing::{debug, warn};

pub struct UsbDevice {
    device: rusb::Device<Context>,
    descriptor: DeviceDescriptor,
    bus_id: String,
    handle: Option<DeviceHandle<Context>>,
    /// Interfaces we claimed (exclusive mode)
    claimed_interfaces: Vec<u8>,
    /// Interfaces whose kernel driver we detached (privileged mode)
    detached_interfaces: Vec<u8>,
}

impl UsbDevice {
    pub fn new(device: rusb::Device<Context>) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        let bus_id = match device.port_numbers() {
            Ok(ports) if !ports.is_empty() => bus_id(device.bus_number(), &ports),
            _ => format!("{}-{}", device.bus_number(), device.address()),
        };

        Ok(Self {
            device,
            descriptor,
            bus_id,
            handle: None,
            claimed_interfaces: Vec::new(),
            detached_interfaces: Vec::new(),
        })
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(
            self.device.bus_number() as u32,
            self.device.address() as u32,
        )
    }

    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Exported view of the device
    ///
    /// String descriptors are read through the claim handle when we hold one,
    /// otherwise through a short-lived handle; unreadable strings are omitted.
    pub fn to_device(&self) -> Device {
        let key = self.key();
        let config = self.device.active_config_descriptor().ok();
        let interfaces = config
            .as_ref()
            .map(|config| {
                config
                    .interfaces()
                    .filter_map(|interface| interface.descriptors().next())
                    .map(|alt| InterfaceInfo {
                        class: alt.class_code(),
                        subclass: alt.sub_class_code(),
                        protocol: alt.protocol_code(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let (manufacturer, product, serial_number) = match &self.handle {
            Some(handle) => self.read_strings(handle),
            None => self
                .device
                .open()
                .map(|handle| self.read_strings(&handle))
                .unwrap_or((None, None, None)),
        };

        let version = self.descriptor.device_version();
        Device {
            path: format!("/sys/bus/usb/devices/{}", self.bus_id),
            bus_id: self.bus_id.clone(),
            bus_num: key.bus_num,
            dev_num: key.dev_num,
            speed: map_device_speed(self.device.speed()),
            vendor_id: self.descriptor.vendor_id(),
            product_id: self.descriptor.product_id(),
            bcd_device: ((version.major() as u16) << 8)
                | ((version.minor() as u16) << 4)
                | version.sub_minor() as u16,
            class: self.descriptor.class_code(),
            subclass: self.descriptor.sub_class_code(),
            protocol: self.descriptor.protocol_code(),
            configuration_value: config.as_ref().map(|c| c.number()).unwrap_or(0),
            num_configurations: self.descriptor.num_configurations(),
            interfaces,
            manufacturer,
            product,
            serial_number,
        }
    }

    /// Open the device and take it according to `mode`
    pub fn claim(&mut self, mode: ClaimMode) -> Result<ClaimMethod, rusb::Error> {
        if self.handle.is_some() {
            return Err(rusb::Error::Busy);
        }
        let handle = self.device.open()?;
        let interfaces = self.interface_numbers()?;

        let method = match mode {
            ClaimMode::Exclusive => {
                let mut claimed = Vec::with_capacity(interfaces.len());
                for &number in &interfaces {
                    if let Err(e) = handle.claim_interface(number) {
                        warn!(
                            "Failed to claim interface {} of {}: {}",
                            number, self.bus_id, e
                        );
                        for &done in &claimed {
                            let _ = handle.release_interface(done);
                        }
                        return Err(e);
                    }
                    claimed.push(number);
                }
                self.claimed_interfaces = claimed;
                ClaimMethod::ExclusiveAccess
            }
            ClaimMode::DetachKernelDrivers => {
                let mut detached = Vec::new();
                for &number in &interfaces {
                    match handle.kernel_driver_active(number) {
                        Ok(true) => {
                            if let Err(e) = handle.detach_kernel_driver(number) {
                                warn!(
                                    "Failed to detach kernel driver from interface {} of {}: {}",
                                    number, self.bus_id, e
                                );
                                for &done in &detached {
                                    let _ = handle.attach_kernel_driver(done);
                                }
                                return Err(e);
                            }
                            debug!("Detached kernel driver from interface {}", number);
                            detached.push(number);
                        }
                        Ok(false) => {}
                        Err(e) => debug!(
                            "Kernel driver state of interface {} unknown: {}",
                            number, e
                        ),
                    }
                }
                self.detached_interfaces = detached.clone();
                if detached.is_empty() {
                    ClaimMethod::Entitlement {
                        grant: "no kernel driver bound".to_string(),
                    }
                } else {
                    ClaimMethod::DriverUnbind {
                        detached_interfaces: detached,
                    }
                }
            }
        };

        self.handle = Some(handle);
        debug!("Claimed {} ({}) as {}", self.key(), self.bus_id, method);
        Ok(method)
    }

    /// Give the device back: release interfaces and reattach kernel drivers
    pub fn release(&mut self) -> Result<(), rusb::Error> {
        let handle = self.handle.take().ok_or(rusb::Error::NotFound)?;
        for interface in self.claimed_interfaces.drain(..) {
            if let Err(e) = handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
        }
        for interface in self.detached_interfaces.drain(..) {
            match handle.attach_kernel_driver(interface) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
                Err(e) => warn!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                ),
            }
        }
        debug!("Released {} ({})", self.key(), self.bus_id);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle_mut(&mut self) -> Option<&mut DeviceHandle<Context>> {
        self.handle.as_mut()
    }

    fn interface_numbers(&self) -> Result<Vec<u8>, rusb::Error> {
        let config = self.device.active_config_descriptor()?;
        Ok(config.interfaces().map(|i| i.number()).collect())
    }

    fn read_strings(
        &self,
        handle: &DeviceHandle<Context>,
    ) -> (Option<String>, Option<String>, Option<String>) {
        let read = |index: Option<u8>| {
            index.and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
        };
        (
            read(self.descriptor.manufacturer_string_index()),
            read(self.descriptor.product_string_index()),
            read(self.descriptor.serial_number_string_index()),
        )
    }
}

/// USB/IP bus id from the bus number and port chain, e.g. `1-2.4`
pub fn bus_id(bus: u8, ports: &[u8]) -> String {
    let chain: Vec<String> = ports.iter().map(u8::to_string).collect();
    format!("{}-{}", bus, chain.join("."))
}

pub fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

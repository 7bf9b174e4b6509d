//! USB device and claim type definitions
//!
//! These types are shared by the USB/IP codec, the IPC protocol between the
//! daemon and the privileged helper, and the persisted claim snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Compound device identity: bus number plus device address on that bus
///
/// This is the key every claim and every pending transfer is indexed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    /// Bus number on the host
    pub bus_num: u32,
    /// Device address on the bus
    pub dev_num: u32,
}

impl DeviceKey {
    pub fn new(bus_num: u32, dev_num: u32) -> Self {
        Self { bus_num, dev_num }
    }

    /// USB/IP `devid` for this device (`busnum << 16 | devnum`)
    pub fn devid(&self) -> u32 {
        (self.bus_num << 16) | (self.dev_num & 0xffff)
    }

    /// Inverse of [`DeviceKey::devid`]
    pub fn from_devid(devid: u32) -> Self {
        Self {
            bus_num: devid >> 16,
            dev_num: devid & 0xffff,
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus_num, self.dev_num)
    }
}

/// USB device speed, carrying the USB/IP `usb_device_speed` code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum DeviceSpeed {
    #[default]
    Unknown = 0,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low = 1,
    /// Full speed - 12 Mbps (USB 1.1)
    Full = 2,
    /// High speed - 480 Mbps (USB 2.0)
    High = 3,
    /// Wireless USB
    Wireless = 4,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super = 5,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus = 6,
}

impl DeviceSpeed {
    /// Wire code used in USB/IP device descriptors
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Map a wire code back to a speed; unknown codes become `Unknown`
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Low,
            2 => Self::Full,
            3 => Self::High,
            4 => Self::Wireless,
            5 => Self::Super,
            6 => Self::SuperPlus,
            _ => Self::Unknown,
        }
    }
}

/// Interface class triple as exported in OP_REP_DEVLIST
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// A USB device as reported by the discovery feed
///
/// Immutable for the duration of one operation; the feed produces fresh
/// values every time it is listed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Device {
    /// sysfs-style path exported to USB/IP clients
    pub path: String,
    /// USB/IP bus id, e.g. "1-1.2"
    pub bus_id: String,
    /// Bus number on the host
    pub bus_num: u32,
    /// Device address on the bus
    pub dev_num: u32,
    pub speed: DeviceSpeed,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Device release number (bcdDevice)
    pub bcd_device: u16,
    /// USB device class
    pub class: u8,
    /// USB device subclass
    pub subclass: u8,
    /// USB device protocol
    pub protocol: u8,
    /// Active configuration value
    pub configuration_value: u8,
    /// Number of configurations
    pub num_configurations: u8,
    /// Interfaces of the active configuration
    pub interfaces: Vec<InterfaceInfo>,
    /// Manufacturer string (if available)
    pub manufacturer: Option<String>,
    /// Product string (if available)
    pub product: Option<String>,
    /// Serial number string (if available)
    pub serial_number: Option<String>,
}

impl Device {
    /// Compound identity of this device
    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(self.bus_num, self.dev_num)
    }

    /// USB/IP `devid`
    pub fn devid(&self) -> u32 {
        self.key().devid()
    }
}

/// USB transfer kind of a submitted URB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Control => "control",
            Self::Bulk => "bulk",
            Self::Interrupt => "interrupt",
            Self::Isochronous => "isochronous",
        };
        f.write_str(name)
    }
}

/// How exclusive host access to a device was obtained
///
/// Selected once at claim time and carried with the claim for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimMethod {
    /// Kernel drivers were detached from the listed interfaces (privileged)
    DriverUnbind { detached_interfaces: Vec<u8> },
    /// Interfaces were claimed in-process without touching kernel drivers
    ExclusiveAccess,
    /// Access granted by an OS access rule; nothing had to be detached
    Entitlement { grant: String },
}

impl ClaimMethod {
    /// Whether this claim was made by the privileged helper
    pub fn is_privileged(&self) -> bool {
        !matches!(self, Self::ExclusiveAccess)
    }
}

impl fmt::Display for ClaimMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DriverUnbind { detached_interfaces } => {
                write!(f, "driver-unbind ({} interfaces)", detached_interfaces.len())
            }
            Self::ExclusiveAccess => f.write_str("exclusive-access"),
            Self::Entitlement { grant } => write!(f, "entitlement ({})", grant),
        }
    }
}

/// Lifecycle state of a device claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimState {
    Pending,
    Claimed,
    Failed,
    Released,
    Disconnected,
}

impl ClaimState {
    /// Terminal states accept no further transitions
    ///
    /// `Failed` is terminal for ordinary events; only an explicit retry leaves it.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Released | Self::Disconnected)
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Failed => "failed",
            Self::Released => "released",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

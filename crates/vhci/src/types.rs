//! Slot table model

use std::path::PathBuf;

use protocol::{UsbDevice, UsbSpeed};

/// Hub-speed class of a virtual port. vhci_hcd pairs each port with either
/// the high-speed root hub or the super-speed one; a device can only be
/// bound to a port of its own class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HubSpeed {
    #[default]
    High,
    Super,
}

impl HubSpeed {
    /// Whether a device of the given transfer speed belongs on this port
    /// class: Super pairs with Super, everything else with High.
    pub fn accepts(self, speed: UsbSpeed) -> bool {
        (self == HubSpeed::Super) == (speed == UsbSpeed::Super)
    }
}

/// Per-port status codes as printed in the controller status attribute
/// (the kernel's `vdev_status` values).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotStatus {
    #[default]
    Null = 4,
    NotAssigned = 5,
    Used = 6,
    Error = 7,
}

impl SlotStatus {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            4 => Some(SlotStatus::Null),
            5 => Some(SlotStatus::NotAssigned),
            6 => Some(SlotStatus::Used),
            7 => Some(SlotStatus::Error),
            _ => None,
        }
    }

    /// The port neither holds a device nor is one being assigned.
    pub fn is_vacant(self) -> bool {
        matches!(self, SlotStatus::Null | SlotStatus::NotAssigned)
    }
}

/// One virtual port and its binding state.
///
/// Invariant upheld by the driver: a `Null` slot has all device-identifying
/// fields zeroed/empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Slot {
    pub hub_speed: HubSpeed,
    /// Stable identity: index into the controller's port table.
    pub port: u8,
    pub status: SlotStatus,
    /// Remote bus/device number packed as `busnum << 16 | devnum`.
    pub device_id: u32,
    /// Attribute-tree path of the bound local USB device node.
    pub sys_path: String,
    /// Resolved device-special-file path, e.g. `/dev/bus/usb/002/033`.
    pub dev_mount_path: PathBuf,
    /// Vendor/product/bus-id of the bound local device.
    pub local_device: UsbDevice,
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        self.status == SlotStatus::Null
    }

    pub fn is_attached(&self) -> bool {
        self.status == SlotStatus::Used
    }

    /// Reset every device-identifying field, keeping port identity, class
    /// and status.
    pub(crate) fn clear_device(&mut self) {
        self.device_id = 0;
        self.sys_path.clear();
        self.dev_mount_path = PathBuf::new();
        self.local_device = UsbDevice::default();
    }
}

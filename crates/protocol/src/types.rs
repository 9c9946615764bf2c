//! Shared USB value types
//!
//! These are the vocabulary types passed between the protocol client, the
//! VHC driver and the reconciliation engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// USB device speed, numbered as in the kernel's `enum usb_device_speed`.
///
/// The same codes appear in the USB/IP device description record and in the
/// vhci_hcd `attach` command string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum UsbSpeed {
    Unknown = 0,
    Low = 1,
    Full = 2,
    High = 3,
    Wireless = 4,
    Super = 5,
}

impl UsbSpeed {
    /// Decode a wire speed code; unrecognized values collapse to `Unknown`.
    pub fn from_wire(code: u32) -> Self {
        match code {
            1 => UsbSpeed::Low,
            2 => UsbSpeed::Full,
            3 => UsbSpeed::High,
            4 => UsbSpeed::Wireless,
            5 => UsbSpeed::Super,
            _ => UsbSpeed::Unknown,
        }
    }

    /// The wire/sysfs code for this speed.
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// A USB/IP server endpoint.
///
/// Used by value as a map key when grouping configured devices by origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identifying summary of a USB device: vendor/product ids plus the bus id
/// it currently occupies on its host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDevice {
    pub vendor: u16,
    pub product: u16,
    pub bus_id: String,
}

impl fmt::Display for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} ({})",
            self.vendor,
            self.product,
            if self.bus_id.is_empty() {
                "?"
            } else {
                &self.bus_id
            }
        )
    }
}

/// The fixed-layout device record shared by devlist entries and the import
/// response, decoded field-by-field from the 312-byte wire form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescription {
    /// Sysfs path of the device on the exporting host
    pub path: String,
    /// Bus id on the exporting host, e.g. "2-1"
    pub bus_id: String,
    pub bus_num: u32,
    pub dev_num: u32,
    pub speed: u32,
    pub vendor: u16,
    pub product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl DeviceDescription {
    /// The vhci device id for this device: remote bus and device number
    /// packed as `busnum << 16 | devnum`.
    pub fn device_id(&self) -> u32 {
        (self.bus_num << 16) | self.dev_num
    }

    /// Decoded speed field.
    pub fn usb_speed(&self) -> UsbSpeed {
        UsbSpeed::from_wire(self.speed)
    }

    /// Identifying summary used by the device catalog.
    pub fn summary(&self) -> UsbDevice {
        UsbDevice {
            vendor: self.vendor,
            product: self.product,
            bus_id: self.bus_id.clone(),
        }
    }
}

//! Slot table management for one vhci_hcd controller family

use std::os::fd::AsRawFd;
use std::path::PathBuf;

use protocol::{UsbDevice, UsbSpeed};
use tracing::debug;

use crate::attr::AttrStore;
use crate::error::{Error, Result};
use crate::types::{HubSpeed, Slot, SlotStatus};

const CONTROLLER_BUS_DIR: &str = "bus/platform/devices";
const CONTROLLER_NAME: &str = "vhci_hcd.0";
const CONTROLLER_PREFIX: &str = "vhci_hcd.";
const USB_DEVICES_DIR: &str = "bus/usb/devices";

/// Bus id token denoting "no device" in status lines.
const EMPTY_BUS_ID: &str = "0-0";

fn controller_attr(name: &str) -> String {
    format!("{CONTROLLER_BUS_DIR}/{CONTROLLER_NAME}/{name}")
}

fn usb_device_path(bus_id: &str) -> String {
    format!("{USB_DEVICES_DIR}/{bus_id}")
}

/// Driver for the virtual host controller's port table.
///
/// One instance owns the slot state for every co-resident `vhci_hcd.<n>`
/// controller. All controllers share a single port index space, so their
/// status attributes are folded into one table.
pub struct VhciDriver<S> {
    store: S,
    dev_root: PathBuf,
    controllers: usize,
    slots: Vec<Slot>,
}

impl<S> std::fmt::Debug for VhciDriver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VhciDriver")
            .field("dev_root", &self.dev_root)
            .field("controllers", &self.controllers)
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

impl<S: AttrStore> VhciDriver<S> {
    /// Initialize against the controller's attribute tree.
    ///
    /// Reads the advertised port count and counts co-resident controllers,
    /// then performs an initial [`refresh`](Self::refresh). Any failure here
    /// is fatal: no driver instance is produced.
    pub fn new(store: S, dev_root: impl Into<PathBuf>) -> Result<Self> {
        let nports_raw = store
            .read_attr(&controller_attr("nports"))
            .map_err(|e| Error::Init(format!("failed to read nports attribute: {e}")))?;
        let nports: u32 = nports_raw
            .parse()
            .map_err(|_| Error::Init(format!("failed to parse nports attribute {nports_raw:?}")))?;
        if nports == 0 {
            return Err(Error::Init(
                "host controller does not have any ports available".into(),
            ));
        }

        let controllers = store
            .list_dir(CONTROLLER_BUS_DIR)
            .map_err(|e| Error::Init(format!("failed to read controller bus dir: {e}")))?
            .iter()
            .filter(|name| name.starts_with(CONTROLLER_PREFIX))
            .count();
        if controllers == 0 {
            return Err(Error::Init("no vhci controllers found".into()));
        }

        let slots = (0..nports)
            .map(|port| Slot {
                port: port as u8,
                ..Default::default()
            })
            .collect();

        let mut driver = Self {
            store,
            dev_root: dev_root.into(),
            controllers,
            slots,
        };
        debug!(
            nports,
            controllers = driver.controllers,
            "initialized vhci driver"
        );
        driver.refresh()?;
        Ok(driver)
    }

    /// Re-read every controller's status attribute and rebuild slot state.
    ///
    /// Parses into a shadow copy of the table and swaps only on full
    /// success, so a malformed line or unreadable device attribute leaves
    /// the previously observed table intact.
    pub fn refresh(&mut self) -> Result<()> {
        let mut next = self.slots.clone();
        for index in 0..self.controllers {
            let name = if index == 0 {
                "status".to_owned()
            } else {
                format!("status.{index}")
            };
            let text = self.store.read_attr(&controller_attr(&name))?;
            self.apply_status_text(&text, &mut next)?;
        }
        self.slots = next;
        Ok(())
    }

    /// Fold one controller's status text into `table`.
    ///
    /// The first line is a column header. Every other non-empty line holds
    /// exactly seven whitespace-separated fields:
    /// `hub port status speed devid sockfd busid`.
    fn apply_status_text(&self, text: &str, table: &mut [Slot]) -> Result<()> {
        for (number, line) in text.lines().enumerate().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            let parsed = parse_status_line(line).ok_or_else(|| Error::Parse {
                line: number,
                text: line.to_owned(),
            })?;
            let index = parsed.port as usize;
            if index >= table.len() {
                return Err(Error::Parse {
                    line: number,
                    text: line.to_owned(),
                });
            }

            let slot = &mut table[index];
            slot.hub_speed = parsed.hub_speed;
            slot.port = parsed.port;
            slot.status = parsed.status;

            if parsed.status.is_vacant() {
                slot.clear_device();
            } else {
                debug!(
                    port = parsed.port,
                    status = ?parsed.status,
                    bus_id = %parsed.bus_id,
                    "processing non-empty virtual port"
                );
                slot.device_id = parsed.device_id;
                slot.sys_path = usb_device_path(&parsed.bus_id);
                self.describe_device(slot, &parsed.bus_id)?;
            }
        }
        Ok(())
    }

    /// Resolve a bus id to full local USB device attributes and the device
    /// node path advertised in its `uevent`.
    fn describe_device(&self, slot: &mut Slot, bus_id: &str) -> Result<()> {
        let sys_path = usb_device_path(bus_id);
        let vendor = self.read_hex16_attr(&sys_path, "idVendor", bus_id)?;
        let product = self.read_hex16_attr(&sys_path, "idProduct", bus_id)?;
        let bus_num = self.read_dec16_attr(&sys_path, "busnum", bus_id)?;
        let dev_num = self.read_dec16_attr(&sys_path, "devnum", bus_id)?;
        let dev_name = self.read_dev_name(&sys_path, bus_id)?;

        debug!(bus_id, bus_num, dev_num, "resolved local device attributes");
        slot.local_device = UsbDevice {
            vendor,
            product,
            bus_id: bus_id.to_owned(),
        };
        slot.dev_mount_path = self.dev_root.join(dev_name);
        Ok(())
    }

    fn read_hex16_attr(&self, sys_path: &str, attr: &str, bus_id: &str) -> Result<u16> {
        let raw = self
            .store
            .read_attr(&format!("{sys_path}/{attr}"))
            .map_err(|e| describe_error(bus_id, attr, &e.to_string()))?;
        u16::from_str_radix(&raw, 16).map_err(|e| describe_error(bus_id, attr, &e.to_string()))
    }

    fn read_dec16_attr(&self, sys_path: &str, attr: &str, bus_id: &str) -> Result<u16> {
        let raw = self
            .store
            .read_attr(&format!("{sys_path}/{attr}"))
            .map_err(|e| describe_error(bus_id, attr, &e.to_string()))?;
        raw.parse()
            .map_err(|e: std::num::ParseIntError| describe_error(bus_id, attr, &e.to_string()))
    }

    /// Extract the `DEVNAME=` value from the device's `uevent` attribute.
    fn read_dev_name(&self, sys_path: &str, bus_id: &str) -> Result<String> {
        let uevent = self
            .store
            .read_attr(&format!("{sys_path}/uevent"))
            .map_err(|e| describe_error(bus_id, "uevent", &e.to_string()))?;
        uevent
            .lines()
            .find_map(|line| line.strip_prefix("DEVNAME="))
            .map(|name| name.trim().to_owned())
            .ok_or_else(|| describe_error(bus_id, "uevent", "no DEVNAME entry"))
    }

    /// First empty slot whose hub-speed class accepts the given transfer
    /// speed.
    pub fn free_port(&self, speed: UsbSpeed) -> Result<u8> {
        self.slots
            .iter()
            .find(|slot| slot.hub_speed.accepts(speed) && slot.is_empty())
            .map(|slot| slot.port)
            .ok_or(Error::NoFreePort { speed })
    }

    /// Bind an imported device to a free port.
    ///
    /// Borrows the raw descriptor underlying `conn` for the duration of the
    /// control write; the connection must stay open and unclosed until this
    /// call returns, and the kernel takes over the socket from there. The
    /// slot table is not updated here; the new `Used` state appears on the
    /// next [`refresh`](Self::refresh).
    pub fn attach<C: AsRawFd>(&self, conn: &C, device_id: u32, speed: UsbSpeed) -> Result<u8> {
        let port = self.free_port(speed)?;
        let fd = conn.as_raw_fd();
        let command = format!("{} {} {} {}", port, fd, device_id, speed.code());
        self.store
            .write_attr(&controller_attr("attach"), &command)
            .map_err(|source| Error::Attach { port, source })?;
        debug!(port, device_id, "issued attach command");
        Ok(port)
    }

    /// Release the device bound to `port`. The table is not updated here.
    pub fn detach(&self, port: u8) -> Result<()> {
        if port as usize >= self.slots.len() {
            return Err(Error::PortOutOfRange(port));
        }
        self.store
            .write_attr(&controller_attr("detach"), &port.to_string())
            .map_err(|source| Error::Detach { port, source })?;
        debug!(port, "issued detach command");
        Ok(())
    }

    /// Current slot table.
    ///
    /// Snapshot semantics are the caller's responsibility; the engine holds
    /// its lock across any read paired with a mutating call.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn port_count(&self) -> usize {
        self.slots.len()
    }

    pub fn controller_count(&self) -> usize {
        self.controllers
    }
}

fn describe_error(bus_id: &str, attr: &str, detail: &str) -> Error {
    Error::Describe {
        bus_id: bus_id.to_owned(),
        detail: format!("{attr}: {detail}"),
    }
}

struct ParsedLine {
    hub_speed: HubSpeed,
    port: u8,
    status: SlotStatus,
    device_id: u32,
    bus_id: String,
}

/// Scan the seven fields of one status line. Any deviation yields `None`;
/// the caller attaches line context.
fn parse_status_line(line: &str) -> Option<ParsedLine> {
    let mut fields = line.split_whitespace();

    let hub_tag = fields.next()?;
    if hub_tag.len() != 2 {
        return None;
    }
    let hub_speed = if hub_tag == "hs" {
        HubSpeed::High
    } else {
        HubSpeed::Super
    };

    let port: u8 = fields.next()?.parse().ok()?;
    let status = SlotStatus::from_code(fields.next()?.parse().ok()?)?;
    let _link_speed: u32 = fields.next()?.parse().ok()?;
    let device_id = u32::from_str_radix(fields.next()?, 16).ok()?;
    let _sock_fd: u32 = fields.next()?.parse().ok()?;

    let bus_id = fields.next()?;
    if bus_id.len() > 31 || fields.next().is_some() {
        return None;
    }
    let bus_id = if bus_id == EMPTY_BUS_ID {
        String::new()
    } else {
        bus_id.to_owned()
    };

    Some(ParsedLine {
        hub_speed,
        port,
        status,
        device_id,
        bus_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_used_high_speed_line() {
        let parsed = parse_status_line("hs  0000 006 002 00010002 000010 2-1").unwrap();
        assert_eq!(parsed.hub_speed, HubSpeed::High);
        assert_eq!(parsed.port, 0);
        assert_eq!(parsed.status, SlotStatus::Used);
        assert_eq!(parsed.device_id, 0x0001_0002);
        assert_eq!(parsed.bus_id, "2-1");
    }

    #[test]
    fn parses_vacant_super_speed_line() {
        let parsed = parse_status_line("ss  0003 004 000 00000000 000000 0-0").unwrap();
        assert_eq!(parsed.hub_speed, HubSpeed::Super);
        assert_eq!(parsed.port, 3);
        assert_eq!(parsed.status, SlotStatus::Null);
        assert_eq!(parsed.device_id, 0);
        assert!(parsed.bus_id.is_empty());
    }

    #[test]
    fn rejects_malformed_lines() {
        // wrong field count
        assert!(parse_status_line("hs 0000 006 002 00010002 000010").is_none());
        assert!(parse_status_line("hs 0000 006 002 00010002 000010 2-1 extra").is_none());
        // non-numeric port
        assert!(parse_status_line("hs port 006 002 00010002 000010 2-1").is_none());
        // unknown status code
        assert!(parse_status_line("hs 0000 002 002 00010002 000010 2-1").is_none());
        // hub tag not two chars
        assert!(parse_status_line("high 0000 006 002 00010002 000010 2-1").is_none());
        // oversized bus id
        let long = format!("hs 0000 006 002 00010002 000010 {}", "b".repeat(32));
        assert!(parse_status_line(&long).is_none());
    }
}

//! Byte-level encoding of USB/IP discovery messages
//!
//! All integers are big-endian. Strings travel in fixed-width NUL-padded
//! fields. Everything here operates on byte buffers only; the socket side
//! lives in [`crate::client`].

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::types::DeviceDescription;

/// Protocol version sent in every request header (1.1.1).
pub const USBIP_VERSION: u16 = 0x0111;

/// Operation code: request the exportable device list.
pub const OP_REQ_DEVLIST: u16 = 0x8005;

/// Operation code: import (claim) one exported device.
pub const OP_REQ_IMPORT: u16 = 0x8003;

/// Common header size: version + code + status.
pub const HEADER_LEN: usize = 8;

/// Width of the fixed bus id field.
pub const BUS_ID_LEN: usize = 32;

/// Width of the fixed sysfs path field.
pub const PATH_LEN: usize = 256;

/// Total size of the device description record.
pub const DEVICE_DESCRIPTION_LEN: usize = PATH_LEN + BUS_ID_LEN + 24;

/// Header common to every USB/IP discovery message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

impl OpHeader {
    /// Header for an outgoing request with the given operation code.
    pub fn request(code: u16) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status: 0,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.version);
        buf.put_u16(self.code);
        buf.put_u32(self.status);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        ensure_remaining(buf, HEADER_LEN)?;
        Ok(Self {
            version: buf.get_u16(),
            code: buf.get_u16(),
            status: buf.get_u32(),
        })
    }
}

/// Encode the body of an OP_REQ_IMPORT: the requested bus id, zero-padded
/// to its fixed field width.
pub fn encode_bus_id(bus_id: &str, buf: &mut impl BufMut) -> Result<()> {
    // One byte is reserved so the field always NUL-terminates.
    if bus_id.len() >= BUS_ID_LEN {
        return Err(Error::BusIdTooLong(bus_id.to_owned()));
    }
    buf.put_slice(bus_id.as_bytes());
    buf.put_bytes(0, BUS_ID_LEN - bus_id.len());
    Ok(())
}

/// Decode a device description record, field by field.
pub fn decode_device_description(buf: &mut impl Buf) -> Result<DeviceDescription> {
    ensure_remaining(buf, DEVICE_DESCRIPTION_LEN)?;
    let path = take_fixed_str(buf, PATH_LEN)?;
    let bus_id = take_fixed_str(buf, BUS_ID_LEN)?;
    Ok(DeviceDescription {
        path,
        bus_id,
        bus_num: buf.get_u32(),
        dev_num: buf.get_u32(),
        speed: buf.get_u32(),
        vendor: buf.get_u16(),
        product: buf.get_u16(),
        bcd_device: buf.get_u16(),
        device_class: buf.get_u8(),
        device_subclass: buf.get_u8(),
        device_protocol: buf.get_u8(),
        configuration_value: buf.get_u8(),
        num_configurations: buf.get_u8(),
        num_interfaces: buf.get_u8(),
    })
}

/// Encode a device description record. The client never sends one; this is
/// the server half of the exchange, kept here so tests can simulate a
/// target end-to-end.
pub fn encode_device_description(desc: &DeviceDescription, buf: &mut impl BufMut) -> Result<()> {
    put_fixed_str(&desc.path, PATH_LEN, buf)?;
    put_fixed_str(&desc.bus_id, BUS_ID_LEN, buf)?;
    buf.put_u32(desc.bus_num);
    buf.put_u32(desc.dev_num);
    buf.put_u32(desc.speed);
    buf.put_u16(desc.vendor);
    buf.put_u16(desc.product);
    buf.put_u16(desc.bcd_device);
    buf.put_u8(desc.device_class);
    buf.put_u8(desc.device_subclass);
    buf.put_u8(desc.device_protocol);
    buf.put_u8(desc.configuration_value);
    buf.put_u8(desc.num_configurations);
    buf.put_u8(desc.num_interfaces);
    Ok(())
}

/// Read a fixed-width field and cut it at the first NUL.
fn take_fixed_str(buf: &mut impl Buf, width: usize) -> Result<String> {
    let mut raw = vec![0u8; width];
    buf.copy_to_slice(&mut raw);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    raw.truncate(end);
    String::from_utf8(raw).map_err(|_| Error::MalformedString)
}

fn put_fixed_str(s: &str, width: usize, buf: &mut impl BufMut) -> Result<()> {
    if s.len() >= width {
        return Err(Error::BusIdTooLong(s.to_owned()));
    }
    buf.put_slice(s.as_bytes());
    buf.put_bytes(0, width - s.len());
    Ok(())
}

fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

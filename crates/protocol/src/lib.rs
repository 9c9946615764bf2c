//! USB/IP wire protocol client
//!
//! Implements the userspace side of the USB/IP discovery protocol spoken by
//! `usbipd` servers: OP_REQ_DEVLIST to enumerate exportable devices and
//! OP_REQ_IMPORT to claim one for attachment. The protocol is plain TCP with
//! big-endian fixed-layout records; see the Linux kernel's
//! tools/usb/usbip/libsrc for the reference encoding.
//!
//! The byte-level codec lives in [`codec`] and is independent of any socket,
//! so it can be exercised without I/O. [`client::Connection`] drives the two
//! request/response exchanges against a live target.

pub mod client;
pub mod codec;
pub mod error;
pub mod types;

pub use client::{Connection, READ_DEADLINE};
pub use codec::{OpHeader, OP_REQ_DEVLIST, OP_REQ_IMPORT, USBIP_VERSION};
pub use error::{Error, Result};
pub use types::{DeviceDescription, Target, UsbDevice, UsbSpeed};

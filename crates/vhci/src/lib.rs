//! Virtual host controller (vhci_hcd) driver
//!
//! The kernel's vhci_hcd module exposes virtual USB ports through sysfs:
//! a `status` attribute listing every port's binding state, and `attach` /
//! `detach` control attributes that bind a port to an imported USB/IP
//! connection or release it.
//!
//! This crate models that interface. [`attr::AttrStore`] abstracts the
//! attribute tree so the driver can run against the real `/sys` or an
//! in-memory fixture; [`driver::VhciDriver`] owns the slot table for one
//! controller family and keeps it in sync with the kernel's view.
//!
//! The driver performs no locking of its own. The reconciliation engine is
//! the single caller and serializes refresh/attach/detach under its lock.

pub mod attr;
pub mod driver;
pub mod error;
pub mod testing;
pub mod types;

pub use attr::{AttrStore, SysfsStore};
pub use driver::VhciDriver;
pub use error::{Error, Result};
pub use types::{HubSpeed, Slot, SlotStatus};

//! usbip-agent library
//!
//! Reconciliation of configured remote USB devices against live USB/IP
//! targets and the local virtual host controller. The binary in this crate
//! wires the engine to the real sysfs tree; the cluster-facing resource
//! advertisement front end consumes [`reconciler::DeviceManager`] through
//! `register`/`allocate`/`subscribe` and supplies its own
//! [`oracle::UsageOracle`] implementation.

pub mod catalog;
pub mod config;
pub mod oracle;
pub mod reconciler;

pub use catalog::{AttachedDevice, DeviceFilter, DeviceKey, DeviceSpec, KnownDevice, MountSpec};
pub use config::AgentConfig;
pub use oracle::{FixedUsage, UsageOracle};
pub use reconciler::{AllocationError, DeviceManager, ManagerSettings, RefreshReport};

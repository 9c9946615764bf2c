//! Shared pieces of the usbip-agent workspace
//!
//! Logging setup and the subscriber fan-out used by the reconciliation
//! engine to announce device availability changes.

pub mod logging;
pub mod notify;

pub use logging::setup_logging;
pub use notify::Broadcaster;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

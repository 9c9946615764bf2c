//! Driver error types

use protocol::UsbSpeed;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Port or controller counts could not be established. Fatal: no driver
    /// instance is produced.
    #[error("driver initialization failed: {0}")]
    Init(String),

    /// Malformed controller status line. Aborts the current refresh; the
    /// previously observed slot table stays in place.
    #[error("malformed status line {line}: {text:?}")]
    Parse { line: usize, text: String },

    /// USB device attributes for a bus id could not be read or parsed.
    #[error("failed to describe device {bus_id}: {detail}")]
    Describe { bus_id: String, detail: String },

    /// No empty slot of the required hub-speed class.
    #[error("no free virtual port for {speed:?}-speed device")]
    NoFreePort { speed: UsbSpeed },

    /// Write to the attach control attribute failed.
    #[error("failed to attach device to port {port}: {source}")]
    Attach {
        port: u8,
        #[source]
        source: std::io::Error,
    },

    /// Write to the detach control attribute failed.
    #[error("failed to detach port {port}: {source}")]
    Detach {
        port: u8,
        #[source]
        source: std::io::Error,
    },

    /// Port index beyond the controller's advertised port count.
    #[error("port number {0} out of bounds")]
    PortOutOfRange(u8),

    /// Attribute tree access failed outside the cases above.
    #[error("attribute access failed: {0}")]
    Attr(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

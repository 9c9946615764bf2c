//! Protocol error types

use thiserror::Error;

/// Errors from talking USB/IP to a remote target.
///
/// `Transport` and `Deadline` mean the connection itself failed; the
/// remaining variants mean the target answered with something we refuse to
/// accept. Callers treat both classes the same way (skip the target for this
/// refresh cycle), but logs benefit from the distinction.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure on the TCP stream
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// The 5 second read deadline expired before a complete response arrived
    #[error("read deadline expired waiting for response")]
    Deadline,

    /// Non-zero status in a response header
    #[error("{op} request refused by target (status {status:#010x})")]
    Status { op: &'static str, status: u32 },

    /// Import response echoed a different bus id than requested
    #[error("import echoed bus id {got:?}, requested {requested:?}")]
    BusIdMismatch { requested: String, got: String },

    /// Devlist entry advertises more interface data than the sanity limit
    #[error("devlist entry carries {bytes} bytes of interface data (max {max})")]
    InterfaceOverflow { bytes: usize, max: usize },

    /// Fixed-width string field held invalid UTF-8
    #[error("fixed-width string field is not valid UTF-8")]
    MalformedString,

    /// Record shorter than its fixed layout
    #[error("record truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    /// Bus id does not fit the 32-byte wire field
    #[error("bus id {0:?} does not fit the 32-byte wire field")]
    BusIdTooLong(String),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the failure is at the transport layer rather than a
    /// malformed or refused exchange.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Deadline)
    }
}

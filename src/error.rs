//! Error types for the bridge
//!
//! Transport-level errors never escape the bridge as faults: they are caught
//! by the service and translated into lifecycle events on the bus.

use thiserror::Error;

/// Opening the device link failed
///
/// Not fatal: reported as a `HardwareConnectionError` event and eligible for a
/// manual retry.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no authorized device available, manual connection required")]
    NoAuthorizedDevice,

    #[error("device '{port}' unavailable: {reason}")]
    Unavailable { port: String, reason: String },

    #[error("device link is already open")]
    AlreadyOpen,

    #[error("another connection attempt is in progress")]
    Busy,

    #[error("connection attempt cancelled by disconnect")]
    Cancelled,

    #[error("failed to enumerate serial ports: {0}")]
    Enumeration(String),
}

/// Writing to the device link failed
///
/// Any write failure on an open link triggers disconnection handling.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("device link is not open")]
    NotOpen,

    #[error("write timed out after {0}ms")]
    Timeout(u64),

    #[error("write cancelled by link close")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a received line does not decode to a channel delta
///
/// Never surfaced to the user; a noisy link produces these routinely and the
/// next device update supersedes a dropped line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed line")]
    Malformed,

    #[error("unsupported channel {0}")]
    UnsupportedChannel(u32),
}

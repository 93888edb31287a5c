//! Errors surfaced to callers of the connection manager.
//!
//! Transport failures and failed verification are reported as events, not
//! through this type; these variants only cover operations that have a caller
//! waiting on a result.

use thiserror::Error;

/// Connection manager errors
#[derive(Error, Debug)]
pub enum PlmError {
    /// A write was requested while no session exists
    #[error("not connected")]
    NotConnected,

    /// `send_hex` input was not valid hexadecimal
    #[error("invalid hex command: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// The transport rejected a write
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The session ended before a queued write was performed
    #[error("session closed before the write completed")]
    SessionClosed,

    /// Listing candidate ports failed
    #[error("port enumeration failed: {0}")]
    Discovery(#[source] std::io::Error),

    /// The manager task is no longer running
    #[error("connection manager stopped")]
    ManagerStopped,
}

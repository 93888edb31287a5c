//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete frame (need more data)
    #[error("incomplete frame")]
    Incomplete,

    /// Unknown command code after a start byte
    #[error("unknown command 0x{0:02x}")]
    Command(u8),

    /// Frame did not begin with the start byte
    #[error("missing start byte, found 0x{0:02x}")]
    StartByte(u8),

    /// Payload length does not match the command
    #[error("payload length {actual} does not match {expected} for {command}")]
    Length {
        /// Command the payload was built for
        command: &'static str,
        /// Expected payload length
        expected: usize,
        /// Actual payload length
        actual: usize,
    },

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,
}

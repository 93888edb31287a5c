//! Command codes, framing, and streaming decoding for the Insteon modem protocol.
//!
//! This crate provides the low-level wire handling for a powerline modem on a
//! serial line: the command code table, per-command frame lengths, a decoder
//! that turns arbitrary byte chunks into messages, and builders for host
//! commands.
//!
//! ## Wire Format
//!
//! ```text
//! +-----------+--------------+----------------------------------+
//! | 0x02      | command code | body (length fixed by the code)  |
//! +-----------+--------------+----------------------------------+
//! ```
//!
//! Replies to host commands (codes `0x60` and up) echo the command and end
//! with `0x06` (ACK) or `0x15` (NAK).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;

// Re-export main types
pub use codec::{encode_command, get_im_info_request, ImInfo};
pub use error::WireError;
pub use frame::{Message, MessageDecoder};
pub use header::{
    CommandCode, ACK, EXTENDED_FLAG, HEADER_SIZE, MAX_FRAME_SIZE, NAK, START_BYTE,
};

//! Encoding of host commands and decoding of typed replies.

use crate::frame::Message;
use crate::header::{CommandCode, START_BYTE};
use bytes::{BufMut, Bytes, BytesMut};

/// Encode a host-to-modem command: start byte, code, then `body`
pub fn encode_command(code: CommandCode, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(crate::HEADER_SIZE + body.len());
    buf.put_u8(START_BYTE);
    buf.put_u8(code.code());
    buf.put_slice(body);
    buf.freeze()
}

/// The identity query sent to confirm a modem is on the line
pub fn get_im_info_request() -> Bytes {
    encode_command(CommandCode::GetImInfo, &[])
}

/// Modem identity returned by `Get IM Info`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImInfo {
    /// INSTEON address of the modem
    pub address: [u8; 3],
    /// Device category
    pub category: u8,
    /// Device subcategory
    pub subcategory: u8,
    /// Firmware revision
    pub firmware: u8,
}

impl ImInfo {
    const PAYLOAD_LEN: usize = 7;

    /// Parse the identity out of a `Get IM Info` reply
    pub fn parse(message: &Message) -> Result<Self, crate::WireError> {
        if message.kind != CommandCode::GetImInfo {
            return Err(crate::WireError::Command(message.kind.code()));
        }
        let p = &message.payload;
        if p.len() != Self::PAYLOAD_LEN {
            return Err(crate::WireError::Length {
                command: CommandCode::GetImInfo.name(),
                expected: Self::PAYLOAD_LEN,
                actual: p.len(),
            });
        }
        Ok(Self {
            address: [p[0], p[1], p[2]],
            category: p[3],
            subcategory: p[4],
            firmware: p[5],
        })
    }
}

impl std::fmt::Display for ImInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02X}.{:02X}.{:02X} (cat 0x{:02x}, subcat 0x{:02x}, fw 0x{:02x})",
            self.address[0],
            self.address[1],
            self.address[2],
            self.category,
            self.subcategory,
            self.firmware
        )
    }
}

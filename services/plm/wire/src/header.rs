//! Two-byte message header for the modem serial protocol.
//!
//! Every message exchanged with the modem starts with the `0x02` start byte
//! followed by a command code. The code alone determines the frame length,
//! except for `Send INSTEON Message` whose length depends on the extended
//! flag in its message flags byte.


/// Start-of-message byte
pub const START_BYTE: u8 = 0x02;

/// Header size in bytes (start byte + command code)
pub const HEADER_SIZE: usize = 2;

/// Longest frame the modem emits (Extended Message Received)
pub const MAX_FRAME_SIZE: usize = 25;

/// Trailing byte the modem appends when it accepted a host command
pub const ACK: u8 = 0x06;

/// Trailing byte the modem appends when it rejected a host command
pub const NAK: u8 = 0x15;

/// Extended message bit in INSTEON message flags
pub const EXTENDED_FLAG: u8 = 0x10;

/// Command codes understood by the modem
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    /// INSTEON standard message received
    StandardMessageReceived = 0x50,
    /// INSTEON extended message received
    ExtendedMessageReceived = 0x51,
    /// X10 message received
    X10Received = 0x52,
    /// ALL-Linking completed
    AllLinkingCompleted = 0x53,
    /// Button event report
    ButtonEventReport = 0x54,
    /// User reset detected
    UserResetDetected = 0x55,
    /// ALL-Link cleanup failure report
    AllLinkCleanupFailureReport = 0x56,
    /// ALL-Link record response
    AllLinkRecordResponse = 0x57,
    /// ALL-Link cleanup status report
    AllLinkCleanupStatusReport = 0x58,
    /// Get IM info (identity query and its response)
    GetImInfo = 0x60,
    /// Send ALL-Link command
    SendAllLinkCommand = 0x61,
    /// Send INSTEON standard or extended message
    SendInsteonMessage = 0x62,
    /// Send X10 message
    SendX10 = 0x63,
    /// Start ALL-Linking
    StartAllLinking = 0x64,
    /// Cancel ALL-Linking
    CancelAllLinking = 0x65,
    /// Set host device category
    SetHostDeviceCategory = 0x66,
    /// Reset the IM
    ResetIm = 0x67,
    /// Set INSTEON ACK message byte
    SetAckMessageByte = 0x68,
    /// Get first ALL-Link record
    GetFirstAllLinkRecord = 0x69,
    /// Get next ALL-Link record
    GetNextAllLinkRecord = 0x6A,
    /// Set IM configuration
    SetImConfiguration = 0x6B,
    /// Get ALL-Link record for sender
    GetAllLinkRecordForSender = 0x6C,
    /// LED on
    LedOn = 0x6D,
    /// LED off
    LedOff = 0x6E,
    /// Manage ALL-Link record
    ManageAllLinkRecord = 0x6F,
    /// Set INSTEON NAK message byte
    SetNakMessageByte = 0x70,
    /// Set INSTEON ACK message two bytes
    SetAckMessageTwoBytes = 0x71,
    /// RF sleep
    RfSleep = 0x72,
    /// Get IM configuration
    GetImConfiguration = 0x73,
}

impl TryFrom<u8> for CommandCode {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x50 => Ok(CommandCode::StandardMessageReceived),
            0x51 => Ok(CommandCode::ExtendedMessageReceived),
            0x52 => Ok(CommandCode::X10Received),
            0x53 => Ok(CommandCode::AllLinkingCompleted),
            0x54 => Ok(CommandCode::ButtonEventReport),
            0x55 => Ok(CommandCode::UserResetDetected),
            0x56 => Ok(CommandCode::AllLinkCleanupFailureReport),
            0x57 => Ok(CommandCode::AllLinkRecordResponse),
            0x58 => Ok(CommandCode::AllLinkCleanupStatusReport),
            0x60 => Ok(CommandCode::GetImInfo),
            0x61 => Ok(CommandCode::SendAllLinkCommand),
            0x62 => Ok(CommandCode::SendInsteonMessage),
            0x63 => Ok(CommandCode::SendX10),
            0x64 => Ok(CommandCode::StartAllLinking),
            0x65 => Ok(CommandCode::CancelAllLinking),
            0x66 => Ok(CommandCode::SetHostDeviceCategory),
            0x67 => Ok(CommandCode::ResetIm),
            0x68 => Ok(CommandCode::SetAckMessageByte),
            0x69 => Ok(CommandCode::GetFirstAllLinkRecord),
            0x6A => Ok(CommandCode::GetNextAllLinkRecord),
            0x6B => Ok(CommandCode::SetImConfiguration),
            0x6C => Ok(CommandCode::GetAllLinkRecordForSender),
            0x6D => Ok(CommandCode::LedOn),
            0x6E => Ok(CommandCode::LedOff),
            0x6F => Ok(CommandCode::ManageAllLinkRecord),
            0x70 => Ok(CommandCode::SetNakMessageByte),
            0x71 => Ok(CommandCode::SetAckMessageTwoBytes),
            0x72 => Ok(CommandCode::RfSleep),
            0x73 => Ok(CommandCode::GetImConfiguration),
            _ => Err(crate::WireError::Command(value)),
        }
    }
}

impl CommandCode {
    /// Raw command byte
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Human readable name as printed in the modem developer guide
    pub fn name(self) -> &'static str {
        match self {
            CommandCode::StandardMessageReceived => "INSTEON Standard Message Received",
            CommandCode::ExtendedMessageReceived => "INSTEON Extended Message Received",
            CommandCode::X10Received => "X10 Received",
            CommandCode::AllLinkingCompleted => "ALL-Linking Completed",
            CommandCode::ButtonEventReport => "Button Event Report",
            CommandCode::UserResetDetected => "User Reset Detected",
            CommandCode::AllLinkCleanupFailureReport => "ALL-Link Cleanup Failure Report",
            CommandCode::AllLinkRecordResponse => "ALL-Link Record Response",
            CommandCode::AllLinkCleanupStatusReport => "ALL-Link Cleanup Status Report",
            CommandCode::GetImInfo => "Get IM Info",
            CommandCode::SendAllLinkCommand => "Send ALL-Link Command",
            CommandCode::SendInsteonMessage => "Send INSTEON Message",
            CommandCode::SendX10 => "Send X10",
            CommandCode::StartAllLinking => "Start ALL-Linking",
            CommandCode::CancelAllLinking => "Cancel ALL-Linking",
            CommandCode::SetHostDeviceCategory => "Set Host Device Category",
            CommandCode::ResetIm => "Reset the IM",
            CommandCode::SetAckMessageByte => "Set INSTEON ACK Message Byte",
            CommandCode::GetFirstAllLinkRecord => "Get First ALL-Link Record",
            CommandCode::GetNextAllLinkRecord => "Get Next ALL-Link Record",
            CommandCode::SetImConfiguration => "Set IM Configuration",
            CommandCode::GetAllLinkRecordForSender => "Get ALL-Link Record for Sender",
            CommandCode::LedOn => "LED On",
            CommandCode::LedOff => "LED Off",
            CommandCode::ManageAllLinkRecord => "Manage ALL-Link Record",
            CommandCode::SetNakMessageByte => "Set INSTEON NAK Message Byte",
            CommandCode::SetAckMessageTwoBytes => "Set INSTEON ACK Message Two Bytes",
            CommandCode::RfSleep => "RF Sleep",
            CommandCode::GetImConfiguration => "Get IM Configuration",
        }
    }

    /// Whether this code is a reply to a host command (and so carries a trailing ACK/NAK)
    pub fn is_command_reply(self) -> bool {
        self.code() >= 0x60
    }

    /// Total length of a frame the modem sends for this code, header included.
    ///
    /// `flags` is the INSTEON message flags byte, only consulted for
    /// [`CommandCode::SendInsteonMessage`]. Returns `None` when the length
    /// cannot be known yet because `flags` is still missing.
    pub fn frame_len(self, flags: Option<u8>) -> Option<usize> {
        let len = match self {
            CommandCode::StandardMessageReceived => 11,
            CommandCode::ExtendedMessageReceived => 25,
            CommandCode::X10Received => 4,
            CommandCode::AllLinkingCompleted => 10,
            CommandCode::ButtonEventReport => 3,
            CommandCode::UserResetDetected => 2,
            CommandCode::AllLinkCleanupFailureReport => 7,
            CommandCode::AllLinkRecordResponse => 10,
            CommandCode::AllLinkCleanupStatusReport => 3,
            CommandCode::GetImInfo => 9,
            CommandCode::SendAllLinkCommand => 6,
            CommandCode::SendInsteonMessage => {
                if flags? & EXTENDED_FLAG != 0 {
                    23
                } else {
                    9
                }
            }
            CommandCode::SendX10 => 5,
            CommandCode::StartAllLinking => 5,
            CommandCode::CancelAllLinking => 3,
            CommandCode::SetHostDeviceCategory => 6,
            CommandCode::ResetIm => 3,
            CommandCode::SetAckMessageByte => 4,
            CommandCode::GetFirstAllLinkRecord => 3,
            CommandCode::GetNextAllLinkRecord => 3,
            CommandCode::SetImConfiguration => 4,
            CommandCode::GetAllLinkRecordForSender => 3,
            CommandCode::LedOn => 3,
            CommandCode::LedOff => 3,
            CommandCode::ManageAllLinkRecord => 12,
            CommandCode::SetNakMessageByte => 4,
            CommandCode::SetAckMessageTwoBytes => 5,
            CommandCode::RfSleep => 3,
            CommandCode::GetImConfiguration => 6,
        };
        Some(len)
    }
}

impl std::fmt::Display for CommandCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

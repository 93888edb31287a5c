//! Message gate between the decoder and consumers.
//!
//! While a session is awaiting verification the only message that matters is
//! the modem's identity reply; it completes the handshake and is consumed.
//! Everything else is dropped until the session is verified, after which
//! messages pass through untouched.

use crate::session::ConnectionState;
use plm_wire::{CommandCode, Message};
use tracing::trace;

/// What to do with one decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Qualifying identity reply; complete the handshake, do not forward
    Acknowledge(Message),
    /// Deliver to consumers
    Forward(Message),
    /// Drop silently
    Discard(Message),
}

/// Filters decoded messages according to connection state
#[derive(Debug, Clone, Copy)]
pub struct MessageGate {
    identity: CommandCode,
}

impl MessageGate {
    /// Gate that accepts `identity` as proof of the peer
    pub fn new(identity: CommandCode) -> Self {
        Self { identity }
    }

    /// Message type that completes verification
    pub fn identity(&self) -> CommandCode {
        self.identity
    }

    /// Decide the fate of `message` for a session in `state`
    pub fn admit(&self, state: ConnectionState, message: Message) -> GateDecision {
        match state {
            ConnectionState::Verified => GateDecision::Forward(message),
            ConnectionState::AwaitingVerification if message.kind == self.identity => {
                GateDecision::Acknowledge(message)
            }
            ConnectionState::AwaitingVerification | ConnectionState::Disconnected => {
                trace!("Gate discarding {} while {}", message.type_name(), state);
                GateDecision::Discard(message)
            }
        }
    }
}

impl Default for MessageGate {
    fn default() -> Self {
        Self::new(CommandCode::GetImInfo)
    }
}

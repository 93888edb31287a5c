//! Connection configuration, session state, and the per-session I/O task.
//!
//! Each `connect` creates a [`Session`] with a fresh [`SessionId`]. The
//! session owns its I/O task and its timers; dropping it aborts the task and
//! cancels the timers, so nothing from a retired session can fire later.
//! Signals the I/O task sends back are tagged with the id so the manager can
//! discard any that were already queued when the session was replaced.

use crate::error::PlmError;
use crate::handshake::Handshake;
use crate::transport::Transport;
use crate::watchdog::Watchdog;
use bytes::{Bytes, BytesMut};
use plm_wire::{Message, MessageDecoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

impl std::fmt::Display for Parity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Parity::None => "N",
            Parity::Even => "E",
            Parity::Odd => "O",
        })
    }
}

/// Line settings handed to the transport on open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits per character
    pub data_bits: u8,
    /// Stop bits
    pub stop_bits: u8,
    /// Parity
    pub parity: Parity,
    /// Hardware flow control
    pub flow_control: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            baud_rate: 19200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: false,
        }
    }
}

impl std::fmt::Display for LinkSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}{}{}{}",
            self.baud_rate,
            self.data_bits,
            self.parity,
            self.stop_bits,
            if self.flow_control { " rtscts" } else { "" }
        )
    }
}

/// Configuration for a modem connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Address to connect to as soon as the manager starts
    pub address: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits per character
    pub data_bits: u8,
    /// Stop bits
    pub stop_bits: u8,
    /// Parity
    pub parity: Parity,
    /// Hardware flow control
    pub flow_control: bool,
    /// Confirm a modem answers before trusting any data
    pub verify_connection: bool,
    /// Interval between identity probes
    pub handshake_interval_ms: u64,
    /// Retries after the first identity probe before giving up
    pub max_handshake_attempts: u32,
    /// Deadline for verification, measured from transport open
    pub watchdog_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let link = LinkSettings::default();
        Self {
            address: None,
            baud_rate: link.baud_rate,
            data_bits: link.data_bits,
            stop_bits: link.stop_bits,
            parity: link.parity,
            flow_control: link.flow_control,
            verify_connection: true,
            handshake_interval_ms: 1000,
            max_handshake_attempts: 5,
            watchdog_delay_ms: 10_000,
        }
    }
}

impl ConnectionConfig {
    /// Configuration targeting `address` with default settings
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    /// Line settings for the transport
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
            flow_control: self.flow_control,
        }
    }

    /// Interval between identity probes (never zero)
    pub fn handshake_interval(&self) -> Duration {
        Duration::from_millis(self.handshake_interval_ms.max(1))
    }

    /// Verification deadline
    pub fn watchdog_delay(&self) -> Duration {
        Duration::from_millis(self.watchdog_delay_ms)
    }

    /// Time from open until an unanswered handshake declares failure
    pub fn handshake_budget(&self) -> Duration {
        self.handshake_interval() * (self.max_handshake_attempts.saturating_add(2))
    }
}

/// Connection state of the active session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No open transport
    Disconnected,
    /// Transport open, waiting for the modem to identify itself
    AwaitingVerification,
    /// Modem identified (or verification disabled); data flows to consumers
    Verified,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::AwaitingVerification => "awaiting verification",
            ConnectionState::Verified => "verified",
        })
    }
}

/// Identity of one `connect` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the I/O task observed on the transport
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// Transport opened
    Opened,
    /// A decoded message arrived
    Message(Message),
    /// Transport failed (open, read or write)
    Failed(std::io::Error),
    /// Peer closed the stream
    Ended,
}

/// Transport event tagged with the session it belongs to
#[derive(Debug)]
pub(crate) struct SessionSignal {
    pub id: SessionId,
    pub event: TransportEvent,
}

/// A queued write and its optional completion
pub(crate) struct WriteRequest {
    bytes: Bytes,
    done: Option<oneshot::Sender<Result<(), PlmError>>>,
}

impl WriteRequest {
    fn complete(self, result: Result<(), PlmError>) {
        if let Some(done) = self.done {
            // Caller may have stopped waiting
            let _ = done.send(result);
        }
    }
}

/// The live session owned by the connection manager
pub(crate) struct Session {
    pub id: SessionId,
    pub address: String,
    pub state: ConnectionState,
    /// Whether the transport reported open
    pub opened: bool,
    pub handshake: Option<Handshake>,
    pub watchdog: Option<Watchdog>,
    writes: mpsc::UnboundedSender<WriteRequest>,
    io: JoinHandle<()>,
}

impl Session {
    /// Start opening a transport to `address`
    pub fn spawn(
        id: SessionId,
        address: String,
        settings: LinkSettings,
        transport: Arc<dyn Transport>,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> Self {
        let (writes, write_rx) = mpsc::unbounded_channel();
        let io = tokio::spawn(run_io(
            id,
            address.clone(),
            settings,
            transport,
            write_rx,
            signals,
        ));

        Self {
            id,
            address,
            state: ConnectionState::Disconnected,
            opened: false,
            handshake: None,
            watchdog: None,
            writes,
            io,
        }
    }

    /// Queue bytes for the transport. Writes issued before open are flushed once it opens.
    pub fn write(&self, bytes: Bytes, done: Option<oneshot::Sender<Result<(), PlmError>>>) {
        if let Err(mpsc::error::SendError(request)) = self.writes.send(WriteRequest { bytes, done }) {
            request.complete(Err(PlmError::SessionClosed));
        }
    }

    /// Stop both session timers
    pub fn cancel_timers(&mut self) {
        self.handshake = None;
        self.watchdog = None;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.io.abort();
    }
}

/// Per-session I/O: open the transport, decode reads, perform writes
async fn run_io(
    id: SessionId,
    address: String,
    settings: LinkSettings,
    transport: Arc<dyn Transport>,
    mut writes: mpsc::UnboundedReceiver<WriteRequest>,
    signals: mpsc::UnboundedSender<SessionSignal>,
) {
    let signal = |event| {
        // Manager gone means nobody cares any more
        let _ = signals.send(SessionSignal { id, event });
    };

    let mut stream = match transport.open(&address, &settings).await {
        Ok(stream) => stream,
        Err(e) => {
            signal(TransportEvent::Failed(e));
            return;
        }
    };
    debug!("Session {} opened transport to {}", id, address);
    signal(TransportEvent::Opened);

    let mut decoder = MessageDecoder::new();
    let mut read_buffer = BytesMut::with_capacity(256);

    loop {
        tokio::select! {
            read = stream.read_buf(&mut read_buffer) => {
                match read {
                    Ok(0) => {
                        signal(TransportEvent::Ended);
                        break;
                    }
                    Ok(n) => {
                        trace!("Session {} read {} bytes from {}", id, n, address);
                        for message in decoder.decode(&read_buffer) {
                            signal(TransportEvent::Message(message));
                        }
                        read_buffer.clear();
                    }
                    Err(e) => {
                        signal(TransportEvent::Failed(e));
                        break;
                    }
                }
            }

            Some(request) = writes.recv() => {
                let result = match stream.write_all(&request.bytes).await {
                    Ok(()) => stream.flush().await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => {
                        trace!("Session {} wrote {} bytes to {}", id, request.bytes.len(), address);
                        request.complete(Ok(()));
                    }
                    Err(e) => {
                        let kind = e.kind();
                        let reason = e.to_string();
                        request.complete(Err(PlmError::Transport(std::io::Error::new(kind, reason))));
                        signal(TransportEvent::Failed(e));
                        break;
                    }
                }
            }
        }
    }
}

//! Transport sessions, verification handshake, and discovery for a powerline modem.
//!
//! This crate owns the connection to one modem. It opens a transport, proves
//! that a modem is actually on the other end before trusting anything it
//! sends, and reports the lifecycle to the application as events.
//!
//! ## Features
//!
//! - **Verification handshake**: repeated `Get IM Info` probes with a bounded retry budget
//! - **Message gate**: nothing reaches consumers until the modem has identified itself
//! - **Verification deadline**: unverified sessions are closed after a configurable delay
//! - **Session identity**: a new `connect` retires the old session and all of its timers
//! - **Discovery**: candidate ports are tried one at a time until a modem answers
//!
//! ## Example
//!
//! ```rust,no_run
//! use plm_session::{ConnectionConfig, ConnectionManager, PlmEvent, TcpTransport};
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> Result<(), plm_session::PlmError> {
//! let (events_tx, mut events) = mpsc::unbounded_channel();
//! let transport = Arc::new(TcpTransport::default());
//! let plm = ConnectionManager::spawn(ConnectionConfig::default(), transport, events_tx);
//!
//! plm.connect("192.168.1.40:9761");
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         PlmEvent::Connected { address } => {
//!             println!("Modem verified on {}", address);
//!             plm.send_hex("02 6D").await?;
//!         }
//!         PlmEvent::Data(message) => println!("Received {}", message.type_name()),
//!         other => println!("{:?}", other),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod gate;
pub mod handshake;
pub mod manager;
pub mod session;
pub mod transport;
pub mod watchdog;

// Re-export main types
pub use error::PlmError;
pub use gate::{GateDecision, MessageGate};
pub use handshake::{Handshake, HandshakeStep};
pub use manager::{ConnectionManager, PlmEvent, PlmHandle};
pub use session::{ConnectionConfig, ConnectionState, LinkSettings, Parity, SessionId};
pub use transport::{connect_tcp, IoStream, PortInfo, TcpTransport, Transport};
pub use watchdog::Watchdog;

//! Connection manager for a single modem.
//!
//! The manager is an actor: one task owns the active session, its handshake
//! and watchdog, and the discovery queue, and handles commands, transport
//! signals and timer ticks one at a time from a single `select!` loop.
//! Callers talk to it through a cloneable [`PlmHandle`] and observe it through
//! a channel of [`PlmEvent`]s.

use crate::error::PlmError;
use crate::gate::{GateDecision, MessageGate};
use crate::handshake::{Handshake, HandshakeStep};
use crate::session::{
    ConnectionConfig, ConnectionState, Session, SessionId, SessionSignal, TransportEvent,
};
use crate::transport::{PortInfo, Transport};
use crate::watchdog::Watchdog;
use bytes::Bytes;
use plm_wire::{get_im_info_request, ImInfo, Message};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Notifications emitted by the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlmEvent {
    /// A modem was verified (or the transport opened with verification disabled)
    Connected {
        /// Address of the session
        address: String,
    },
    /// The session ended
    Disconnected {
        /// Address of the session
        address: String,
    },
    /// No modem answered the identity probes
    VerificationFailed {
        /// Address of the session
        address: String,
    },
    /// A message from a verified modem
    Data(Message),
    /// Discovery tried every candidate without finding a modem
    DiscoveryExhausted,
}

/// Why a session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownReason {
    /// Transport reported an error (including failure to open)
    TransportError,
    /// Peer closed the stream
    TransportEnded,
    /// Verification deadline elapsed
    WatchdogExpired,
    /// Identity probes went unanswered
    VerificationExhausted,
    /// A newer `connect` replaced the session
    Superseded,
    /// Caller asked to disconnect
    Closed,
}

impl TeardownReason {
    /// Whether this ends the current discovery candidate
    fn is_failure(self) -> bool {
        matches!(
            self,
            TeardownReason::TransportError
                | TeardownReason::TransportEnded
                | TeardownReason::WatchdogExpired
                | TeardownReason::VerificationExhausted
        )
    }
}

/// Which session timer fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionTimer {
    HandshakeTick,
    WatchdogExpired,
}

enum Command {
    Connect {
        address: String,
    },
    Send {
        bytes: Bytes,
        done: oneshot::Sender<Result<(), PlmError>>,
    },
    Discover {
        candidates: Vec<String>,
    },
    Disconnect,
    State {
        reply: oneshot::Sender<ConnectionState>,
    },
}

/// Control surface of a running [`ConnectionManager`]
#[derive(Clone)]
pub struct PlmHandle {
    commands: mpsc::UnboundedSender<Command>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for PlmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlmHandle").finish_non_exhaustive()
    }
}

impl PlmHandle {
    fn command(&self, command: Command) -> Result<(), PlmError> {
        self.commands
            .send(command)
            .map_err(|_| PlmError::ManagerStopped)
    }

    /// Open a new session to `address`, replacing any current one.
    ///
    /// Returns immediately; the outcome arrives as events.
    pub fn connect(&self, address: impl Into<String>) {
        let address = address.into();
        if self.command(Command::Connect { address: address.clone() }).is_err() {
            warn!("Cannot connect to {}: connection manager stopped", address);
        }
    }

    /// Write raw bytes to the current session and wait for the write to finish
    pub async fn send(&self, bytes: impl Into<Bytes>) -> Result<(), PlmError> {
        let (done, completion) = oneshot::channel();
        self.command(Command::Send {
            bytes: bytes.into(),
            done,
        })?;
        completion.await.map_err(|_| PlmError::SessionClosed)?
    }

    /// Write a hex encoded command such as `"0262 112233 0F 11 FF"`
    pub async fn send_hex(&self, hex: &str) -> Result<(), PlmError> {
        let compact: String = hex.split_whitespace().collect();
        let bytes = hex::decode(compact)?;
        self.send(bytes).await
    }

    /// Enumerate candidate ports and try them one after another.
    ///
    /// Returns the candidates found. Enumeration failure leaves any active
    /// session untouched.
    pub async fn discover(&self) -> Result<Vec<PortInfo>, PlmError> {
        let ports = match self.transport.list_ports().await {
            Ok(ports) => ports,
            Err(e) => {
                warn!("Went looking for a modem, but listing ports failed: {}", e);
                return Err(PlmError::Discovery(e));
            }
        };

        debug!("The following ports are available:");
        for (index, port) in ports.iter().enumerate() {
            debug!(
                "    Port {}: path {}, make {}, id {}",
                index,
                port.address,
                port.manufacturer.as_deref().unwrap_or("unknown"),
                port.pnp_id.as_deref().unwrap_or("unknown")
            );
        }

        self.command(Command::Discover {
            candidates: ports.iter().map(|port| port.address.clone()).collect(),
        })?;
        Ok(ports)
    }

    /// Tear down the current session and stop any discovery in progress
    pub fn disconnect(&self) {
        if self.command(Command::Disconnect).is_err() {
            debug!("Disconnect ignored: connection manager stopped");
        }
    }

    /// Current connection state
    pub async fn state(&self) -> Result<ConnectionState, PlmError> {
        let (reply, state) = oneshot::channel();
        self.command(Command::State { reply })?;
        state.await.map_err(|_| PlmError::ManagerStopped)
    }
}

/// Actor owning the connection to one modem
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    gate: MessageGate,
    session: Option<Session>,
    next_session_id: u64,
    /// Candidates still to try, present only while discovery runs
    discovery: Option<VecDeque<String>>,
    commands: mpsc::UnboundedReceiver<Command>,
    signals_tx: mpsc::UnboundedSender<SessionSignal>,
    signals_rx: mpsc::UnboundedReceiver<SessionSignal>,
    events: mpsc::UnboundedSender<PlmEvent>,
}

impl ConnectionManager {
    /// Start a manager on the current runtime.
    ///
    /// Connects to `config.address` straight away when it is set. The manager
    /// stops once every handle has been dropped.
    pub fn spawn(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<PlmEvent>,
    ) -> PlmHandle {
        if config.verify_connection && config.watchdog_delay() <= config.handshake_budget() {
            warn!(
                "Verification deadline {:?} is shorter than the handshake budget {:?}; \
                 unanswered sessions will be closed before verification can fail",
                config.watchdog_delay(),
                config.handshake_budget()
            );
        }

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let handle = PlmHandle {
            commands: commands_tx,
            transport: transport.clone(),
        };

        if let Some(address) = config.address.clone() {
            handle.connect(address);
        }

        let manager = Self {
            config,
            transport,
            gate: MessageGate::default(),
            session: None,
            next_session_id: 0,
            discovery: None,
            commands,
            signals_tx,
            signals_rx,
            events,
        };
        tokio::spawn(manager.run());

        handle
    }

    /// Run the manager until every handle is dropped
    async fn run(mut self) {
        info!("Starting connection manager");

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            info!("All handles dropped; connection manager shutting down");
                            break;
                        }
                    }
                }

                Some(signal) = self.signals_rx.recv() => {
                    self.handle_signal(signal);
                }

                timer = next_timer(&mut self.session) => {
                    self.handle_timer(timer);
                }
            }
        }

        // Aborts the I/O task and cancels timers
        self.session = None;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { address } => {
                if self.discovery.take().is_some() {
                    info!("Explicit connect to {} cancels discovery", address);
                }
                self.open_session(address);
            }
            Command::Send { bytes, done } => match &self.session {
                Some(session) => session.write(bytes, Some(done)),
                None => {
                    // Caller may have stopped waiting
                    let _ = done.send(Err(PlmError::NotConnected));
                }
            },
            Command::Discover { candidates } => {
                info!("Starting discovery over {} candidate ports", candidates.len());
                self.discovery = Some(candidates.into());
                self.advance_discovery();
            }
            Command::Disconnect => {
                self.discovery = None;
                self.teardown(TeardownReason::Closed);
            }
            Command::State { reply } => {
                let _ = reply.send(self.state());
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map(|session| session.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn emit(&self, event: PlmEvent) {
        if self.events.send(event).is_err() {
            trace!("No event listener; dropping event");
        }
    }

    /// Replace the current session with a new one to `address`
    fn open_session(&mut self, address: String) {
        self.teardown(TeardownReason::Superseded);

        self.next_session_id += 1;
        let id = SessionId(self.next_session_id);
        info!("Opening session {} to {}", id, address);

        self.session = Some(Session::spawn(
            id,
            address,
            self.config.link_settings(),
            self.transport.clone(),
            self.signals_tx.clone(),
        ));
    }

    fn handle_signal(&mut self, signal: SessionSignal) {
        let Some(session) = self.session.as_ref() else {
            trace!("Dropping {:?} from retired session {}", signal.event, signal.id);
            return;
        };
        if session.id != signal.id {
            trace!("Dropping {:?} from retired session {}", signal.event, signal.id);
            return;
        }

        match signal.event {
            TransportEvent::Opened => self.on_open(),
            TransportEvent::Message(message) => self.on_message(message),
            TransportEvent::Failed(e) => {
                warn!("Transport error on {}: {}", session.address, e);
                self.teardown(TeardownReason::TransportError);
            }
            TransportEvent::Ended => {
                info!("Transport to {} ended", session.address);
                self.teardown(TeardownReason::TransportEnded);
            }
        }
    }

    fn on_open(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.opened = true;

        if self.config.verify_connection {
            info!(
                "Transport to {} open; waiting for a {} reply",
                session.address,
                self.gate.identity()
            );
            session.state = ConnectionState::AwaitingVerification;
            session.handshake = Some(Handshake::start(
                self.config.handshake_interval(),
                self.config.max_handshake_attempts,
            ));
            session.watchdog = Some(Watchdog::arm(self.config.watchdog_delay()));
        } else {
            info!("Transport to {} open; verification disabled", session.address);
            let address = session.address.clone();
            self.mark_verified(address);
        }
    }

    fn on_message(&mut self, message: Message) {
        let state = self.state();
        match self.gate.admit(state, message) {
            GateDecision::Acknowledge(message) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                let Some(handshake) = session.handshake.as_mut() else {
                    return;
                };
                if !handshake.succeed() {
                    return;
                }
                let probes = handshake.attempts();
                if message.acknowledged() == Some(false) {
                    // A NAK still proves a modem is on the line
                    debug!("Identity reply on {} carried a NAK", session.address);
                }
                match ImInfo::parse(&message) {
                    Ok(im) => info!(
                        "Modem {} verified on {} after {} probes",
                        im, session.address, probes
                    ),
                    Err(e) => info!(
                        "Modem verified on {} after {} probes ({})",
                        session.address, probes, e
                    ),
                }
                let address = session.address.clone();
                self.mark_verified(address);
            }
            GateDecision::Forward(message) => self.emit(PlmEvent::Data(message)),
            GateDecision::Discard(_) => {}
        }
    }

    fn mark_verified(&mut self, address: String) {
        if let Some(session) = self.session.as_mut() {
            session.cancel_timers();
            session.state = ConnectionState::Verified;
        }
        if self.discovery.take().is_some() {
            info!("Discovery found a modem on {}", address);
        }
        self.emit(PlmEvent::Connected { address });
    }

    fn handle_timer(&mut self, timer: SessionTimer) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match timer {
            SessionTimer::HandshakeTick => {
                let step = session.handshake.as_mut().and_then(Handshake::on_tick);
                match step {
                    Some(HandshakeStep::Probe { attempt }) => {
                        debug!("Sending identity probe {} to {}", attempt, session.address);
                        session.write(get_im_info_request(), None);
                    }
                    Some(HandshakeStep::Exhausted { attempts }) => {
                        warn!(
                            "No modem answered {} identity probes on {}",
                            attempts, session.address
                        );
                        self.teardown(TeardownReason::VerificationExhausted);
                    }
                    None => {}
                }
            }
            SessionTimer::WatchdogExpired => {
                let Some(watchdog) = session.watchdog.take() else {
                    return;
                };
                if session.state == ConnectionState::AwaitingVerification {
                    warn!(
                        "Verification deadline of {:?} elapsed on {}; closing transport",
                        watchdog.delay(),
                        session.address
                    );
                    self.teardown(TeardownReason::WatchdogExpired);
                }
            }
        }
    }

    /// Destroy the current session and report how it ended
    fn teardown(&mut self, reason: TeardownReason) {
        let Some(session) = self.session.take() else {
            return;
        };
        let address = session.address.clone();
        let opened = session.opened;
        debug!("Tearing down session {} to {} ({:?})", session.id, address, reason);
        // Aborts the I/O task and cancels both timers
        drop(session);

        match reason {
            TeardownReason::VerificationExhausted => {
                self.emit(PlmEvent::VerificationFailed { address });
            }
            TeardownReason::Superseded | TeardownReason::Closed if !opened => {}
            _ => self.emit(PlmEvent::Disconnected { address }),
        }

        if reason.is_failure() {
            self.advance_discovery();
        }
    }

    /// Try the next discovery candidate, if discovery is running
    fn advance_discovery(&mut self) {
        let Some(candidates) = self.discovery.as_mut() else {
            return;
        };
        match candidates.pop_front() {
            Some(address) => {
                info!("Trying candidate port {}", address);
                self.open_session(address);
            }
            None => {
                self.discovery = None;
                warn!("No modem found on any candidate port");
                self.emit(PlmEvent::DiscoveryExhausted);
            }
        }
    }
}

/// Wait for whichever timer of the active session fires first
async fn next_timer(session: &mut Option<Session>) -> SessionTimer {
    let Some(Session {
        handshake,
        watchdog,
        ..
    }) = session.as_mut()
    else {
        return std::future::pending().await;
    };

    tokio::select! {
        _ = async {
            match handshake {
                Some(handshake) => handshake.tick().await,
                None => std::future::pending().await,
            }
        } => SessionTimer::HandshakeTick,
        _ = async {
            match watchdog {
                Some(watchdog) => watchdog.expired().await,
                None => std::future::pending().await,
            }
        } => SessionTimer::WatchdogExpired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LinkSettings;
    use crate::transport::IoStream;
    use async_trait::async_trait;
    use bytes::Buf;
    use std::io;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{ready, Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::time::sleep;

    const IM_INFO: [u8; 9] = [0x02, 0x60, 0x1A, 0x2B, 0x3C, 0x03, 0x15, 0x9B, 0x06];
    const IM_INFO_NAK: [u8; 9] = [0x02, 0x60, 0x1A, 0x2B, 0x3C, 0x03, 0x15, 0x9B, 0x15];
    const BUTTON_EVENT: [u8; 3] = [0x02, 0x54, 0x03];

    /// Stream whose reads are fed by the test and whose writes are recorded
    struct FakeLink {
        inbound: mpsc::UnboundedReceiver<io::Result<Bytes>>,
        pending: Bytes,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl AsyncRead for FakeLink {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            if this.pending.is_empty() {
                match ready!(this.inbound.poll_recv(cx)) {
                    Some(Ok(bytes)) => this.pending = bytes,
                    Some(Err(e)) => return Poll::Ready(Err(e)),
                    None => return Poll::Ready(Ok(())),
                }
            }
            let n = this.pending.len().min(buf.remaining());
            buf.put_slice(&this.pending[..n]);
            this.pending.advance(n);
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for FakeLink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Test side of an opened [`FakeLink`]
    struct Link {
        address: String,
        inbound: mpsc::UnboundedSender<io::Result<Bytes>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Link {
        fn respond(&self, bytes: &'static [u8]) {
            // The session may already be gone
            let _ = self.inbound.send(Ok(Bytes::from_static(bytes)));
        }

        fn fail(&self) {
            let _ = self
                .inbound
                .send(Err(io::Error::new(io::ErrorKind::BrokenPipe, "cable pulled")));
        }

        fn written(&self) -> Vec<u8> {
            self.written.lock().unwrap().clone()
        }

        fn probes(&self) -> usize {
            self.written()
                .windows(2)
                .filter(|pair| pair == &[0x02, 0x60])
                .count()
        }
    }

    struct FakeTransport {
        links: mpsc::UnboundedSender<Link>,
        ports: Option<Vec<PortInfo>>,
        refused: Vec<String>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open(&self, address: &str, _settings: &LinkSettings) -> io::Result<IoStream> {
            if self.refused.iter().any(|refused| refused == address) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such port"));
            }
            let (inbound_tx, inbound) = mpsc::unbounded_channel();
            let written = Arc::new(Mutex::new(Vec::new()));
            let _ = self.links.send(Link {
                address: address.to_string(),
                inbound: inbound_tx,
                written: written.clone(),
            });
            Ok(IoStream::new(FakeLink {
                inbound,
                pending: Bytes::new(),
                written,
            }))
        }

        async fn list_ports(&self) -> io::Result<Vec<PortInfo>> {
            self.ports
                .clone()
                .ok_or_else(|| io::Error::new(io::ErrorKind::PermissionDenied, "no access"))
        }
    }

    struct Harness {
        handle: PlmHandle,
        events: mpsc::UnboundedReceiver<PlmEvent>,
        links: mpsc::UnboundedReceiver<Link>,
    }

    impl Harness {
        fn start(config: ConnectionConfig) -> Self {
            Self::start_with(config, Some(Vec::new()), Vec::new())
        }

        fn start_with(
            config: ConnectionConfig,
            ports: Option<Vec<PortInfo>>,
            refused: Vec<&str>,
        ) -> Self {
            let (links_tx, links) = mpsc::unbounded_channel();
            let transport = Arc::new(FakeTransport {
                links: links_tx,
                ports,
                refused: refused.into_iter().map(String::from).collect(),
            });
            let (events_tx, events) = mpsc::unbounded_channel();
            let handle = ConnectionManager::spawn(config, transport, events_tx);
            Self {
                handle,
                events,
                links,
            }
        }

        async fn link(&mut self) -> Link {
            self.links.recv().await.expect("transport opened")
        }

        async fn event(&mut self) -> PlmEvent {
            self.events.recv().await.expect("event")
        }

        /// Let every pending task run without moving the clock far
        async fn settle(&self) {
            sleep(Duration::from_millis(1)).await;
        }

        fn assert_no_event(&mut self) {
            assert!(
                self.events.try_recv().is_err(),
                "unexpected event pending"
            );
        }
    }

    fn verifying_config() -> ConnectionConfig {
        ConnectionConfig {
            verify_connection: true,
            max_handshake_attempts: 5,
            handshake_interval_ms: 1000,
            ..ConnectionConfig::default()
        }
    }

    fn connected(address: &str) -> PlmEvent {
        PlmEvent::Connected {
            address: address.to_string(),
        }
    }

    fn disconnected(address: &str) -> PlmEvent {
        PlmEvent::Disconnected {
            address: address.to_string(),
        }
    }

    fn verification_failed(address: &str) -> PlmEvent {
        PlmEvent::VerificationFailed {
            address: address.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_handshake_fails_after_six_probes() {
        let mut h = Harness::start(verifying_config());
        h.handle.connect("plm0");
        let link = h.link().await;

        assert_eq!(h.event().await, verification_failed("plm0"));
        assert_eq!(link.probes(), 6);
        assert_eq!(h.handle.state().await.unwrap(), ConnectionState::Disconnected);

        // Nothing else happens afterwards, watchdog included
        sleep(Duration::from_secs(30)).await;
        assert_eq!(link.probes(), 6);
        h.assert_no_event();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_declared_one_interval_after_last_probe() {
        let mut h = Harness::start(verifying_config());
        h.handle.connect("plm0");
        let link = h.link().await;

        sleep(Duration::from_millis(6500)).await;
        assert_eq!(link.probes(), 6);
        h.assert_no_event();

        assert_eq!(h.event().await, verification_failed("plm0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_after_second_probe_verifies() {
        let mut h = Harness::start(verifying_config());
        h.handle.connect("plm0");
        let link = h.link().await;

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(link.probes(), 2);
        assert_eq!(
            h.handle.state().await.unwrap(),
            ConnectionState::AwaitingVerification
        );

        link.respond(&IM_INFO);
        assert_eq!(h.event().await, connected("plm0"));
        assert_eq!(h.handle.state().await.unwrap(), ConnectionState::Verified);

        // Handshake timer is gone and the reply was not leaked as data
        sleep(Duration::from_secs(30)).await;
        assert_eq!(link.probes(), 2);
        h.assert_no_event();
    }

    #[tokio::test(start_paused = true)]
    async fn test_nak_identity_reply_still_verifies() {
        let mut h = Harness::start(verifying_config());
        h.handle.connect("plm0");
        let link = h.link().await;
        sleep(Duration::from_millis(1500)).await;

        link.respond(&IM_INFO_NAK);
        assert_eq!(h.event().await, connected("plm0"));
        assert_eq!(h.handle.state().await.unwrap(), ConnectionState::Verified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_second_reply_is_data_not_a_second_connect() {
        let mut h = Harness::start(verifying_config());
        h.handle.connect("plm0");
        let link = h.link().await;
        sleep(Duration::from_millis(1500)).await;

        link.respond(&IM_INFO);
        link.respond(&IM_INFO);

        assert_eq!(h.event().await, connected("plm0"));
        match h.event().await {
            PlmEvent::Data(message) => assert_eq!(message.raw.as_ref(), &IM_INFO),
            other => panic!("expected data, got {:?}", other),
        }
        h.settle().await;
        h.assert_no_event();
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_before_verification_is_discarded() {
        let mut h = Harness::start(verifying_config());
        h.handle.connect("plm0");
        let link = h.link().await;

        link.respond(&BUTTON_EVENT);
        h.settle().await;
        h.assert_no_event();

        link.respond(&IM_INFO);
        assert_eq!(h.event().await, connected("plm0"));

        link.respond(&BUTTON_EVENT);
        match h.event().await {
            PlmEvent::Data(message) => assert_eq!(message.raw.as_ref(), &BUTTON_EVENT),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_disabled_connects_on_open() {
        let config = ConnectionConfig {
            verify_connection: false,
            ..ConnectionConfig::default()
        };
        let mut h = Harness::start(config);
        h.handle.connect("plm0");
        let link = h.link().await;

        assert_eq!(h.event().await, connected("plm0"));

        link.respond(&BUTTON_EVENT);
        match h.event().await {
            PlmEvent::Data(message) => {
                assert_eq!(message.type_name(), "Button Event Report");
                assert_eq!(message.raw.as_ref(), &BUTTON_EVENT);
            }
            other => panic!("expected data, got {:?}", other),
        }

        sleep(Duration::from_secs(30)).await;
        assert_eq!(link.probes(), 0);
        h.assert_no_event();
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_on_verified_session_disconnects() {
        let mut h = Harness::start(verifying_config());
        h.handle.connect("plm0");
        let link = h.link().await;
        link.respond(&IM_INFO);
        assert_eq!(h.event().await, connected("plm0"));

        link.fail();
        assert_eq!(h.event().await, disconnected("plm0"));
        assert_eq!(h.handle.state().await.unwrap(), ConnectionState::Disconnected);
        assert!(matches!(
            h.handle.send(vec![0x02, 0x6D]).await,
            Err(PlmError::NotConnected)
        ));

        h.settle().await;
        h.assert_no_event();
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_during_verification_disconnects_once() {
        let mut h = Harness::start(verifying_config());
        h.handle.connect("plm0");
        let link = h.link().await;

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(link.probes(), 2);

        link.fail();
        assert_eq!(h.event().await, disconnected("plm0"));
        assert_eq!(h.handle.state().await.unwrap(), ConnectionState::Disconnected);

        // Neither the handshake nor the deadline outlives the session
        sleep(Duration::from_secs(30)).await;
        assert_eq!(link.probes(), 2);
        h.assert_no_event();
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_closing_stream_disconnects() {
        let mut h = Harness::start(verifying_config());
        h.handle.connect("plm0");
        let link = h.link().await;
        link.respond(&IM_INFO);
        assert_eq!(h.event().await, connected("plm0"));

        drop(link);
        assert_eq!(h.event().await, disconnected("plm0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_reports_disconnect() {
        let mut h = Harness::start_with(verifying_config(), Some(Vec::new()), vec!["missing"]);
        h.handle.connect("missing");

        assert_eq!(h.event().await, disconnected("missing"));
        assert_eq!(h.handle.state().await.unwrap(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_writes_to_session() {
        let mut h = Harness::start(verifying_config());
        assert!(matches!(
            h.handle.send(vec![0x02, 0x6D]).await,
            Err(PlmError::NotConnected)
        ));

        h.handle.connect("plm0");
        let link = h.link().await;
        link.respond(&IM_INFO);
        assert_eq!(h.event().await, connected("plm0"));

        h.handle.send(vec![0x02, 0x6D]).await.unwrap();
        h.handle.send_hex("02 6E").await.unwrap();
        assert_eq!(link.written(), vec![0x02, 0x6D, 0x02, 0x6E]);

        assert!(matches!(
            h.handle.send_hex("02 6Z").await,
            Err(PlmError::InvalidHex(_))
        ));
        assert_eq!(link.written().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_before_open_is_flushed_on_open() {
        let mut h = Harness::start(verifying_config());
        h.handle.connect("plm0");
        h.handle.send(vec![0x02, 0x6D]).await.unwrap();

        let link = h.link().await;
        assert_eq!(link.written(), vec![0x02, 0x6D]);
        assert_eq!(link.probes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_failed_open_reports_session_closed() {
        let mut h = Harness::start_with(verifying_config(), Some(Vec::new()), vec!["missing"]);
        h.handle.connect("missing");

        assert!(matches!(
            h.handle.send(vec![0x02, 0x6D]).await,
            Err(PlmError::SessionClosed)
        ));
        assert_eq!(h.event().await, disconnected("missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_supersedes_previous_session() {
        let mut h = Harness::start(verifying_config());
        h.handle.connect("old");
        let old = h.link().await;
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(old.probes(), 1);

        h.handle.connect("new");
        let new = h.link().await;
        assert_eq!(new.address, "new");
        assert_eq!(h.event().await, disconnected("old"));

        // The old session's reply and timers no longer matter
        old.respond(&IM_INFO);
        h.settle().await;
        h.assert_no_event();

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(old.probes(), 1);
        assert_eq!(new.probes(), 2);

        new.respond(&IM_INFO);
        assert_eq!(h.event().await, connected("new"));

        // Well past the old session's deadline and handshake budget
        sleep(Duration::from_secs(30)).await;
        assert_eq!(old.probes(), 1);
        h.assert_no_event();
        assert_eq!(h.handle.state().await.unwrap(), ConnectionState::Verified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_verified_emits_one_disconnect_between_connects() {
        let mut h = Harness::start(verifying_config());
        h.handle.connect("plm0");
        let first = h.link().await;
        first.respond(&IM_INFO);
        assert_eq!(h.event().await, connected("plm0"));

        h.handle.connect("plm0");
        let second = h.link().await;
        assert_eq!(h.event().await, disconnected("plm0"));
        second.respond(&IM_INFO);
        assert_eq!(h.event().await, connected("plm0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_closes_unverified_session() {
        let config = ConnectionConfig {
            watchdog_delay_ms: 2500,
            ..verifying_config()
        };
        let mut h = Harness::start(config);
        h.handle.connect("plm0");
        let link = h.link().await;

        assert_eq!(h.event().await, disconnected("plm0"));
        assert_eq!(link.probes(), 2);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(link.probes(), 2);
        h.assert_no_event();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_never_closes_verified_session() {
        let mut h = Harness::start(verifying_config());
        h.handle.connect("plm0");
        let link = h.link().await;
        link.respond(&IM_INFO);
        assert_eq!(h.event().await, connected("plm0"));

        sleep(Duration::from_secs(120)).await;
        h.assert_no_event();
        assert_eq!(h.handle.state().await.unwrap(), ConnectionState::Verified);
        h.handle.send(vec![0x02, 0x6D]).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_tears_down_session() {
        let mut h = Harness::start(verifying_config());
        h.handle.connect("plm0");
        let link = h.link().await;
        link.respond(&IM_INFO);
        assert_eq!(h.event().await, connected("plm0"));

        h.handle.disconnect();
        assert_eq!(h.event().await, disconnected("plm0"));
        assert_eq!(h.handle.state().await.unwrap(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_address_connects_on_spawn() {
        let mut h = Harness::start(ConnectionConfig::with_address("plm0"));
        let link = h.link().await;
        assert_eq!(link.address, "plm0");
        link.respond(&IM_INFO);
        assert_eq!(h.event().await, connected("plm0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_tries_candidates_sequentially() {
        let ports = vec![PortInfo::new("a"), PortInfo::new("b"), PortInfo::new("c")];
        let mut h = Harness::start_with(verifying_config(), Some(ports), vec!["a"]);

        let found = h.handle.discover().await.unwrap();
        assert_eq!(found.len(), 3);

        assert_eq!(h.event().await, disconnected("a"));

        let b = h.link().await;
        assert_eq!(b.address, "b");
        // c is not tried while b is still being verified
        sleep(Duration::from_millis(5500)).await;
        assert!(h.links.try_recv().is_err());

        assert_eq!(h.event().await, verification_failed("b"));
        assert_eq!(b.probes(), 6);

        let c = h.link().await;
        assert_eq!(c.address, "c");
        c.respond(&IM_INFO);
        assert_eq!(h.event().await, connected("c"));

        sleep(Duration::from_secs(30)).await;
        h.assert_no_event();
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_exhausted() {
        let ports = vec![PortInfo::new("a"), PortInfo::new("b")];
        let mut h = Harness::start_with(verifying_config(), Some(ports), vec!["a", "b"]);

        h.handle.discover().await.unwrap();
        assert_eq!(h.event().await, disconnected("a"));
        assert_eq!(h.event().await, disconnected("b"));
        assert_eq!(h.event().await, PlmEvent::DiscoveryExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_enumeration_failure_keeps_session() {
        let mut h = Harness::start_with(verifying_config(), None, Vec::new());
        h.handle.connect("plm0");
        let link = h.link().await;
        link.respond(&IM_INFO);
        assert_eq!(h.event().await, connected("plm0"));

        assert!(matches!(
            h.handle.discover().await,
            Err(PlmError::Discovery(_))
        ));

        h.settle().await;
        h.assert_no_event();
        assert_eq!(h.handle.state().await.unwrap(), ConnectionState::Verified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_connect_cancels_discovery() {
        let ports = vec![PortInfo::new("a"), PortInfo::new("b")];
        let mut h = Harness::start_with(verifying_config(), Some(ports), Vec::new());

        h.handle.discover().await.unwrap();
        let a = h.link().await;
        assert_eq!(a.address, "a");
        h.settle().await;

        h.handle.connect("manual");
        let manual = h.link().await;
        assert_eq!(manual.address, "manual");
        assert_eq!(h.event().await, disconnected("a"));

        assert_eq!(h.event().await, verification_failed("manual"));
        sleep(Duration::from_secs(30)).await;
        assert!(h.links.try_recv().is_err());
        h.assert_no_event();
    }
}

//! Byte transports for modem sessions.
//!
//! A [`Transport`] opens byte streams to an address and enumerates the
//! addresses worth probing. The bundled [`TcpTransport`] reaches modems
//! exposed through a serial-to-TCP bridge (ser2net, the Insteon Hub raw port);
//! line settings are applied by the bridge and only logged here.

use crate::session::LinkSettings;
use async_trait::async_trait;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// Any bidirectional byte stream a transport can hand out
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Unified stream type returned by every transport
pub struct IoStream {
    inner: Box<dyn AsyncStream>,
}

impl IoStream {
    /// Wrap a concrete stream
    pub fn new<S: AsyncStream + 'static>(stream: S) -> Self {
        Self {
            inner: Box::new(stream),
        }
    }
}

impl std::fmt::Debug for IoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoStream").finish_non_exhaustive()
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut *self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A candidate address reported by port enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Address passed to [`Transport::open`]
    pub address: String,
    /// Manufacturer, when the platform reports one
    pub manufacturer: Option<String>,
    /// Plug-and-play identifier, when the platform reports one
    pub pnp_id: Option<String>,
}

impl PortInfo {
    /// A candidate with no extra metadata
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            manufacturer: None,
            pnp_id: None,
        }
    }
}

/// Provider of byte streams to modems
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a stream to `address` with the given line settings
    async fn open(&self, address: &str, settings: &LinkSettings) -> std::io::Result<IoStream>;

    /// Enumerate addresses that may have a modem attached
    async fn list_ports(&self) -> std::io::Result<Vec<PortInfo>>;
}

/// TCP transport for serial-over-TCP bridges
#[derive(Debug, Clone)]
pub struct TcpTransport {
    candidates: Vec<PortInfo>,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Create a transport that reports `candidates` from [`Transport::list_ports`]
    pub fn new(candidates: Vec<PortInfo>) -> Self {
        Self {
            candidates,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Override the TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Connect to a TCP address
pub async fn connect_tcp(address: &str, timeout: Duration) -> std::io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {:?}", address, timeout),
            )
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, address: &str, settings: &LinkSettings) -> std::io::Result<IoStream> {
        debug!(
            "Connecting to bridge at {} (line settings {} applied by the bridge)",
            address, settings
        );
        let stream = connect_tcp(address, self.connect_timeout).await?;
        Ok(IoStream::new(stream))
    }

    async fn list_ports(&self) -> std::io::Result<Vec<PortInfo>> {
        Ok(self.candidates.clone())
    }
}

//! Type-erased byte-stream connections.
//!
//! Accept hooks may wrap a socket in TLS, strip a PROXY header, or anything
//! else that yields a byte stream, so sockets travel through the crate as a
//! boxed [`Io`] together with the addresses a `TcpStream` would have reported.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tonic::transport::server::Connected;

use crate::peer_id::PeerId;

/// Keep-alive period applied to every reverse-dialed or accepted socket.
pub(crate) const KEEPALIVE_PERIOD: Duration = Duration::from_secs(5);

/// Linger applied to sockets dialed by the reverse listener.
pub(crate) const LINGER: Duration = Duration::from_secs(1);

/// Bidirectional byte stream usable as a transport.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A transport connection with the metadata of the socket it came from.
pub struct Connection {
    io: Box<dyn Io>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    origin: Option<String>,
}

impl Connection {
    /// Wrap any byte stream. Addresses are unknown until set.
    pub fn new(io: impl Io) -> Self {
        Self {
            io: Box::new(io),
            peer_addr: None,
            local_addr: None,
            origin: None,
        }
    }

    /// Wrap a TCP stream, recording its addresses.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let local_addr = stream.local_addr().ok();
        Self {
            io: Box::new(stream),
            peer_addr,
            local_addr,
            origin: None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Source address reported by a PROXY header, if one was parsed.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Take the stream out, keeping the metadata for [`Connection::with_io`].
    pub fn into_parts(self) -> (Box<dyn Io>, ConnectionInfo) {
        let info = self.info(None);
        (self.io, info)
    }

    /// Reassemble a connection from a stream and previously taken metadata.
    pub fn with_io(io: impl Io, info: ConnectionInfo) -> Self {
        Self {
            io: Box::new(io),
            peer_addr: info.remote_addr,
            local_addr: info.local_addr,
            origin: info.origin,
        }
    }

    /// Record the relay-reported origin. When it is an IP address the peer
    /// address takes that IP and keeps the socket's port.
    pub fn set_origin(&mut self, origin: String) {
        if let Ok(ip) = origin.parse() {
            self.peer_addr = self.peer_addr.map(|mut addr| {
                addr.set_ip(ip);
                addr
            });
        }
        self.origin = Some(origin);
    }

    pub(crate) fn info(&self, peer_id: Option<PeerId>) -> ConnectionInfo {
        ConnectionInfo {
            peer_id,
            remote_addr: self.peer_addr,
            local_addr: self.local_addr,
            origin: self.origin.clone(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Enable TCP keep-alive with the given period.
pub(crate) fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(period);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Set SO_LINGER.
pub(crate) fn set_linger(stream: &TcpStream, linger: Duration) -> io::Result<()> {
    SockRef::from(stream).set_linger(Some(linger))
}

/// Connection metadata exposed to tonic handlers via `Request::extensions`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Identifier the connection was dialed for, when known.
    pub peer_id: Option<PeerId>,
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    /// Relay-reported origin, when a PROXY header was parsed.
    pub origin: Option<String>,
}

impl Connected for Connection {
    type ConnectInfo = ConnectionInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info(None)
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

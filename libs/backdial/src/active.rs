//! Dialed connections that only count once real traffic shows up.
//!
//! The reverse listener keeps a dialed socket "pending" until the passive
//! client starts a session on it. The first bytes the client sends are
//! compared against known preambles (a TLS handshake record, the HTTP/2
//! connection preface); a match moves the connection to `Active` and fires
//! its ready signal so the dial loop can open the next socket.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};
use tonic::transport::server::Connected;

use crate::conn::{Connection, ConnectionInfo};
use crate::opts::ServerConfig;
use crate::peer_id::PeerId;
use crate::signal::Signal;

/// TLS handshake record header (record type 0x16, version TLS 1.0).
pub const TLS_HANDSHAKE: &[u8] = &[0x16, 0x03, 0x01];

/// Start of the HTTP/2 client connection preface sent by h2c clients.
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0";

/// Lifecycle of a reverse-dialed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActivationState {
    /// No recognised preamble observed yet.
    Pending = 0,
    /// A preamble was observed; reads pass straight through.
    Active = 1,
    /// Closed before any preamble was observed.
    Closed = 2,
}

impl ActivationState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ActivationState::Pending,
            1 => ActivationState::Active,
            _ => ActivationState::Closed,
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    ready: Signal,
}

impl Shared {
    /// Leave `Pending` exactly once; the winner fires the ready signal.
    fn leave_pending(&self, to: ActivationState) -> bool {
        let moved = self
            .state
            .compare_exchange(
                ActivationState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if moved {
            self.ready.fire();
        }
        moved
    }

    fn state(&self) -> ActivationState {
        ActivationState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Handle the dial loop keeps to learn when a connection left `Pending`.
#[derive(Debug, Clone)]
pub(crate) struct Activation(Arc<Shared>);

impl Activation {
    pub(crate) async fn wait(&self) {
        self.0.ready.wait().await
    }

    pub(crate) fn state(&self) -> ActivationState {
        self.0.state()
    }
}

/// A reverse-dialed connection handed to the RPC server's accept loop.
pub struct ActiveConnection {
    conn: Connection,
    peer_id: PeerId,
    shared: Arc<Shared>,
    preambles: Arc<[Bytes]>,
    sniffed: Vec<u8>,
    sniff_limit: usize,
    activation_timeout: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl ActiveConnection {
    pub(crate) fn new(conn: Connection, peer_id: PeerId, config: &ServerConfig) -> Self {
        let preambles: Arc<[Bytes]> = config.preambles.clone().into();
        let sniff_limit = preambles.iter().map(Bytes::len).max().unwrap_or(0);
        Self {
            conn,
            peer_id,
            shared: Arc::new(Shared {
                state: AtomicU8::new(ActivationState::Pending as u8),
                ready: Signal::new(),
            }),
            preambles,
            sniffed: Vec::with_capacity(sniff_limit),
            sniff_limit,
            activation_timeout: config.activation_timeout,
            deadline: None,
        }
    }

    pub(crate) fn activation(&self) -> Activation {
        Activation(Arc::clone(&self.shared))
    }

    pub fn state(&self) -> ActivationState {
        self.shared.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ActivationState::Active
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.local_addr()
    }

    fn sniff(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.sniffed.len() < self.sniff_limit {
            let take = (self.sniff_limit - self.sniffed.len()).min(data.len());
            self.sniffed.extend_from_slice(&data[..take]);
        }
        if self
            .preambles
            .iter()
            .any(|preamble| self.sniffed.starts_with(preamble))
        {
            self.shared.leave_pending(ActivationState::Active);
        }
    }
}

impl std::fmt::Debug for ActiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveConnection")
            .field("peer_id", &self.peer_id)
            .field("state", &self.state())
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.shared.leave_pending(ActivationState::Closed);
    }
}

impl Connected for ActiveConnection {
    type ConnectInfo = ConnectionInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.conn.info(Some(self.peer_id.clone()))
    }
}

impl AsyncRead for ActiveConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shared.state() != ActivationState::Pending {
            return Pin::new(&mut this.conn).poll_read(cx, buf);
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.conn).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.deadline = None;
                this.sniff(&buf.filled()[before..]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.deadline = None;
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                let timeout = this.activation_timeout;
                let deadline = this
                    .deadline
                    .get_or_insert_with(|| Box::pin(sleep(timeout)));
                match deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.deadline = None;
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "reverse connection saw no traffic before the activation deadline",
                        )))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl AsyncWrite for ActiveConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().conn).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().conn).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.shared.leave_pending(ActivationState::Closed);
        Pin::new(&mut this.conn).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().conn).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.conn.is_write_vectored()
    }
}

//! Per-peer pool of idle sockets and idle channels.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::FutureExt;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::debug;

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::opts::ClientConfig;
use crate::peer_id::PeerId;
use crate::replay::Replay;
use crate::{MAX_IDLE, MIN_IDLE};

/// Bytes an idle socket may buffer from its peer before liveness checks stop
/// draining it.
const EARLY_DATA_LIMIT: usize = 64 * 1024;

/// A channel built over one reverse-dialed socket.
///
/// Hand it back with `put` when the call is done so the pool can decide
/// whether to keep it.
#[derive(Debug, Clone)]
pub struct PooledChannel {
    peer_id: PeerId,
    channel: Channel,
    remote_addr: Option<SocketAddr>,
}

impl PooledChannel {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Address of the socket the channel runs over (the relay origin when a
    /// PROXY header was parsed).
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn into_inner(self) -> Channel {
        self.channel
    }
}

/// A handshaken socket waiting for a channel to be built over it.
struct IdleConn {
    conn: Connection,
    /// Bytes the server side sent while the socket sat idle (its HTTP/2
    /// settings, usually). Replayed to the channel that takes the socket.
    early: Vec<u8>,
}

impl IdleConn {
    fn new(conn: Connection) -> Self {
        Self {
            conn,
            early: Vec::new(),
        }
    }

    /// Drain whatever the socket has ready without waiting. False once the
    /// peer closed it or it failed.
    fn is_open(&mut self) -> bool {
        let mut buf = [0u8; 4096];
        while self.early.len() < EARLY_DATA_LIMIT {
            match self.conn.read(&mut buf).now_or_never() {
                None => return true,
                Some(Ok(0)) | Some(Err(_)) => return false,
                Some(Ok(n)) => self.early.extend_from_slice(&buf[..n]),
            }
        }
        true
    }

    fn into_conn(self) -> Connection {
        if self.early.is_empty() {
            return self.conn;
        }
        let (io, info) = self.conn.into_parts();
        Connection::with_io(Replay::new(io, self.early), info)
    }
}

#[derive(Default)]
struct Queues {
    conns: VecDeque<IdleConn>,
    channels: VecDeque<Channel>,
}

impl Queues {
    /// Pop the oldest socket whose peer has not hung up, discarding the
    /// closed ones in front of it.
    fn pop_open_conn(&mut self, peer_id: &PeerId) -> Option<Connection> {
        while let Some(mut idle) = self.conns.pop_front() {
            if idle.is_open() {
                return Some(idle.into_conn());
            }
            debug!(peer_id = %peer_id, "Discarding idle socket closed by peer");
        }
        None
    }
}

/// Idle resources for one peer.
pub struct Pool {
    peer_id: PeerId,
    queues: Mutex<Queues>,
    config: Arc<ClientConfig>,
}

impl Pool {
    pub(crate) fn new(peer_id: PeerId, config: Arc<ClientConfig>) -> Self {
        Self {
            peer_id,
            queues: Mutex::new(Queues::default()),
            config,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Acquire a channel.
    ///
    /// Each attempt either discards one idle channel, builds a channel over
    /// one idle socket, or sleeps for the poll interval when nothing is idle.
    /// Sockets the peer already closed are skipped without using an attempt.
    /// Idle channels are never reused. Fails with [`Error::NoConnection`] once
    /// the attempt budget is spent.
    pub async fn get(&self) -> Result<PooledChannel> {
        for attempt in 0..self.config.acquire_attempts {
            let conn = {
                let mut queues = self.queues.lock().await;
                if let Some(channel) = queues.channels.pop_front() {
                    drop(channel);
                    continue;
                }
                queues.pop_open_conn(&self.peer_id)
            };

            let Some(conn) = conn else {
                sleep(self.config.acquire_poll_interval).await;
                continue;
            };

            match self.connect(conn).await {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    log_event!(
                        self.config.log,
                        warn,
                        "build channel to {} failed (attempt {}): {}",
                        self.peer_id,
                        attempt + 1,
                        e
                    );
                }
            }
        }

        Err(Error::NoConnection(self.peer_id.clone()))
    }

    /// Return a channel. Failed channels are dropped, as is any channel that
    /// would push the idle count past `MAX_IDLE - MIN_IDLE`.
    pub async fn put(
        &self,
        channel: PooledChannel,
        error: Option<&(dyn std::error::Error + Send + Sync)>,
    ) {
        if let Some(error) = error {
            debug!(peer_id = %self.peer_id, error = %error, "Dropping failed channel");
            return;
        }

        let mut queues = self.queues.lock().await;
        if queues.channels.len() >= MAX_IDLE - MIN_IDLE {
            debug!(peer_id = %self.peer_id, "Idle channel limit reached, dropping channel");
            return;
        }
        queues.channels.push_back(channel.into_inner());
    }

    /// Enqueue a freshly handshaken socket.
    ///
    /// Idle sockets the peer has since closed are pruned first. Then the
    /// oldest sockets are evicted until the new one fits within `MAX_IDLE`
    /// idle resources.
    pub async fn put_conn(&self, conn: Connection) {
        let mut queues = self.queues.lock().await;

        let queued = queues.conns.len();
        queues.conns.retain_mut(IdleConn::is_open);
        let pruned = queued - queues.conns.len();

        let mut evicted = 0;
        while queues.conns.len() + queues.channels.len() >= MAX_IDLE {
            if queues.conns.pop_front().is_none() {
                break;
            }
            evicted += 1;
        }
        if pruned > 0 || evicted > 0 {
            debug!(peer_id = %self.peer_id, pruned, evicted, "Trimmed idle sockets");
        }

        queues.conns.push_back(IdleConn::new(conn));
    }

    /// Idle `(sockets, channels)`.
    pub async fn idle_counts(&self) -> (usize, usize) {
        let queues = self.queues.lock().await;
        (queues.conns.len(), queues.channels.len())
    }

    async fn connect(&self, conn: Connection) -> Result<PooledChannel> {
        let remote_addr = conn.peer_addr();
        let uri = match remote_addr {
            Some(addr) => format!("http://{addr}"),
            None => "http://localhost".to_string(),
        };
        let endpoint = self.config.endpoint(Endpoint::from_shared(uri)?);

        // The connector yields the socket once; a reconnect has nothing to
        // dial and fails.
        let slot = Arc::new(Mutex::new(Some(conn)));
        let connector = tower::service_fn(move |_: Uri| {
            let slot = Arc::clone(&slot);
            async move {
                slot.lock().await.take().map(TokioIo::new).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotConnected,
                        "reverse connection already consumed",
                    )
                })
            }
        });
        let channel = endpoint.connect_with_connector(connector).await?;

        for check in &self.config.channel_checks {
            check.check(&channel).await.map_err(Error::ChannelCheck)?;
        }

        debug!(peer_id = %self.peer_id, remote_addr = ?remote_addr, "Channel established");
        Ok(PooledChannel {
            peer_id: self.peer_id.clone(),
            channel,
            remote_addr,
        })
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

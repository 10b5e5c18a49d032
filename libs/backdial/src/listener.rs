//! The server role's listener: dials out and hands sockets to the RPC server.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, Instrument};

use crate::active::ActiveConnection;
use crate::conn::{self, Connection, KEEPALIVE_PERIOD, LINGER};
use crate::error::{Error, Result};
use crate::opts::{ServerConfig, ServerOption};
use crate::peer_id::PeerId;
use crate::signal::Signal;
use crate::{MAX_ID_LEN, MIN_IDLE};

/// Pause after a failed connect or frame write.
const DIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Pause after an accept hook rejects a dialed socket.
const HOOK_BACKOFF: Duration = Duration::from_secs(5);

/// A listener whose "accepted" connections are sockets it dialed itself.
///
/// A background task keeps one outbound connection to the passive client
/// in flight at a time: once the client starts using a socket (or the socket
/// closes) the next one is dialed. Pass [`ReverseListener::incoming`] to
/// `tonic::transport::Server::serve_with_incoming`.
///
/// Cloning yields another handle to the same listener. The dial task stops
/// when [`ReverseListener::close`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct ReverseListener {
    inner: Arc<Inner>,
}

struct Inner {
    addr: SocketAddr,
    peer_id: PeerId,
    conns: Mutex<mpsc::Receiver<ActiveConnection>>,
    stop: Arc<Signal>,
    dialer: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop.fire();
        self.dialer.abort();
    }
}

impl ReverseListener {
    /// Validate `peer_id`, resolve `address` and start dialing it.
    pub async fn listen(address: &str, peer_id: &str, opts: &[&dyn ServerOption]) -> Result<Self> {
        let peer_id = PeerId::new(peer_id)?;
        let addr = resolve(address).await?;
        let config = Arc::new(ServerConfig::from_options(opts));

        let (tx, rx) = mpsc::channel(MIN_IDLE - 1);
        let stop = Arc::new(Signal::new());

        let dialer = Dialer {
            addr,
            peer_id: peer_id.clone(),
            frame: peer_id.to_frame(),
            config,
            tx,
            stop: Arc::clone(&stop),
        };
        let span = tracing::info_span!("reverse_listener", peer_id = %peer_id, target = %addr);
        let dialer = tokio::spawn(dialer.run().instrument(span));

        info!(peer_id = %peer_id, target = %addr, "Reverse listener started");

        Ok(Self {
            inner: Arc::new(Inner {
                addr,
                peer_id,
                conns: Mutex::new(rx),
                stop,
                dialer,
            }),
        })
    }

    /// Wait for the next dialed connection.
    ///
    /// Fails with [`Error::ListenerStopped`] once the listener is closed.
    pub async fn accept(&self) -> Result<ActiveConnection> {
        let mut conns = self.inner.conns.lock().await;
        let received = tokio::select! {
            biased;
            _ = self.inner.stop.wait() => None,
            conn = conns.recv() => conn,
        };
        match received {
            Some(conn) => Ok(conn),
            None => {
                drain(&mut conns);
                Err(Error::ListenerStopped)
            }
        }
    }

    /// Connections as a stream that ends when the listener stops.
    pub fn incoming(&self) -> impl Stream<Item = Result<ActiveConnection>> + Send + 'static {
        futures_util::stream::unfold(self.clone(), |listener| async move {
            match listener.accept().await {
                Ok(conn) => Some((Ok(conn), listener)),
                Err(Error::ListenerStopped) => None,
                Err(e) => Some((Err(e), listener)),
            }
        })
    }

    /// Stop dialing and drop connections nobody accepted yet. Idempotent.
    pub fn close(&self) {
        if self.inner.stop.fire() {
            info!(peer_id = %self.inner.peer_id, "Reverse listener closed");
        }
        if let Ok(mut conns) = self.inner.conns.try_lock() {
            drain(&mut conns);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.stop.is_fired()
    }

    /// The resolved address of the passive client.
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Same as [`ReverseListener::addr`]; the listener has no local socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }
}

impl std::fmt::Debug for ReverseListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseListener")
            .field("addr", &self.inner.addr)
            .field("peer_id", &self.inner.peer_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn drain(conns: &mut mpsc::Receiver<ActiveConnection>) {
    conns.close();
    while conns.try_recv().is_ok() {}
}

async fn resolve(address: &str) -> Result<SocketAddr> {
    let invalid = |source| Error::InvalidAddress {
        address: address.to_string(),
        source,
    };
    lookup_host(address)
        .await
        .map_err(invalid)?
        .next()
        .ok_or_else(|| {
            invalid(io::Error::new(
                io::ErrorKind::NotFound,
                "address resolved to nothing",
            ))
        })
}

/// Why a dial attempt was abandoned, and how long to wait before the next.
struct DialFailure {
    stage: &'static str,
    error: io::Error,
    backoff: Duration,
}

impl DialFailure {
    fn new(stage: &'static str, backoff: Duration) -> impl FnOnce(io::Error) -> Self {
        move |error| Self {
            stage,
            error,
            backoff,
        }
    }
}

struct Dialer {
    addr: SocketAddr,
    peer_id: PeerId,
    frame: [u8; MAX_ID_LEN],
    config: Arc<ServerConfig>,
    tx: mpsc::Sender<ActiveConnection>,
    stop: Arc<Signal>,
}

impl Dialer {
    async fn run(self) {
        while !self.stop.is_fired() {
            let conn = match self.establish().await {
                Ok(conn) => conn,
                Err(failure) => {
                    log_event!(
                        self.config.log,
                        warn,
                        "reverse dial to {} {} failed: {}",
                        self.addr,
                        failure.stage,
                        failure.error
                    );
                    if !self.pause(failure.backoff).await {
                        break;
                    }
                    continue;
                }
            };

            let conn = ActiveConnection::new(conn, self.peer_id.clone(), &self.config);
            let activation = conn.activation();

            tokio::select! {
                _ = self.stop.wait() => break,
                sent = self.tx.send(conn) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }

            // One socket in flight at a time: wait until the client uses it
            // or it goes away.
            tokio::select! {
                _ = self.stop.wait() => break,
                _ = activation.wait() => {}
            }
            debug!(state = ?activation.state(), "Reverse connection left pending");
        }
        debug!("Dial loop stopped");
    }

    async fn establish(&self) -> std::result::Result<Connection, DialFailure> {
        let stream = timeout(self.config.dial_timeout, TcpStream::connect(self.addr))
            .await
            .unwrap_or_else(|_| Err(timed_out("connect")))
            .map_err(DialFailure::new("connect", DIAL_BACKOFF))?;

        if let Err(e) = conn::set_linger(&stream, LINGER) {
            debug!(error = %e, "Failed to set linger");
        }
        if let Err(e) = conn::set_keepalive(&stream, KEEPALIVE_PERIOD) {
            debug!(error = %e, "Failed to enable keep-alive");
        }

        let mut conn = Connection::from_tcp(stream);
        for hook in &self.config.accept_hooks {
            conn = hook
                .on_accept(conn)
                .await
                .map_err(DialFailure::new("accept hook", HOOK_BACKOFF))?;
        }

        let write = async {
            conn.write_all(&self.frame).await?;
            conn.flush().await
        };
        timeout(self.config.handshake_timeout, write)
            .await
            .unwrap_or_else(|_| Err(timed_out("peer id write")))
            .map_err(DialFailure::new("handshake", DIAL_BACKOFF))?;

        debug!(local_addr = ?conn.local_addr(), "Reverse connection established");
        Ok(conn)
    }

    /// Sleep for `backoff` unless stopped first. Returns false when stopped.
    async fn pause(&self, backoff: Duration) -> bool {
        tokio::select! {
            _ = self.stop.wait() => false,
            _ = sleep(backoff) => true,
        }
    }
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::active::ActivationState;
    use futures_util::StreamExt;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn read_frame(socket: &mut TcpStream) -> PeerId {
        let mut frame = [0u8; MAX_ID_LEN];
        socket.read_exact(&mut frame).await.unwrap();
        PeerId::from_frame(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_listen_validates_peer_id() {
        let err = ReverseListener::listen("127.0.0.1:1", "", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyPeerId));

        let long = "x".repeat(MAX_ID_LEN + 1);
        let err = ReverseListener::listen("127.0.0.1:1", &long, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerIdTooLong { len: 33, .. }));
    }

    #[tokio::test]
    async fn test_listen_rejects_bad_address() {
        let err = ReverseListener::listen("not an address", "edge-1", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn test_dials_and_sends_frame() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = server.local_addr().unwrap();
        let listener = ReverseListener::listen(&target.to_string(), "edge-1", &[])
            .await
            .unwrap();
        assert_eq!(listener.addr(), target);

        let (mut socket, _) = server.accept().await.unwrap();
        assert_eq!(read_frame(&mut socket).await.as_str(), "edge-1");

        let conn = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.peer_id().as_str(), "edge-1");
        assert_eq!(conn.state(), ActivationState::Pending);
    }

    #[tokio::test]
    async fn test_next_dial_waits_for_activation() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = server.local_addr().unwrap().to_string();
        let listener = ReverseListener::listen(&target, "edge-1", &[]).await.unwrap();

        let (mut first, _) = server.accept().await.unwrap();
        read_frame(&mut first).await;
        let mut conn = listener.accept().await.unwrap();

        // Nothing is dialed while the first socket is still pending.
        assert!(timeout(Duration::from_millis(200), server.accept())
            .await
            .is_err());

        tokio::io::AsyncWriteExt::write_all(&mut first, crate::active::H2_PREFACE)
            .await
            .unwrap();
        let mut buf = [0u8; 32];
        conn.read(&mut buf).await.unwrap();
        assert!(conn.is_active());

        let (mut second, _) = timeout(Duration::from_secs(2), server.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read_frame(&mut second).await.as_str(), "edge-1");
    }

    #[tokio::test]
    async fn test_silent_connection_is_redialed() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = server.local_addr().unwrap().to_string();
        let deadline = crate::opts::with_activation_timeout(Duration::from_millis(100));
        let listener = ReverseListener::listen(&target, "edge-1", &[&deadline])
            .await
            .unwrap();

        let (mut first, _) = server.accept().await.unwrap();
        read_frame(&mut first).await;
        let mut conn = listener.accept().await.unwrap();

        let mut buf = [0u8; 32];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        drop(conn);

        let (mut second, _) = timeout(Duration::from_secs(2), server.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read_frame(&mut second).await.as_str(), "edge-1");
        let conn = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.state(), ActivationState::Pending);
    }

    #[tokio::test]
    async fn test_close_stops_accept_and_incoming() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = server.local_addr().unwrap().to_string();
        let listener = ReverseListener::listen(&target, "edge-1", &[]).await.unwrap();
        let mut incoming = Box::pin(listener.incoming());

        listener.close();
        listener.close();
        assert!(listener.is_closed());

        assert!(matches!(
            listener.accept().await,
            Err(Error::ListenerStopped)
        ));
        let next = timeout(Duration::from_secs(1), incoming.next())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_dial_failure_logged_to_sink() {
        // Bind then drop to get a port nobody listens on.
        let target = {
            let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
            unused.local_addr().unwrap().to_string()
        };
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&seen);
        let log = crate::opts::with_log_func(move |msg| sink.lock().unwrap().push(msg.to_string()));

        let listener = ReverseListener::listen(&target, "edge-1", &[&log])
            .await
            .unwrap();
        sleep(Duration::from_millis(300)).await;
        listener.close();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen[0].contains("connect failed"), "{}", seen[0]);
    }
}

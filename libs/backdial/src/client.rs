//! The client role: accepts reverse-dialed sockets and dials peers over them.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tonic::transport::Channel;
use tracing::{debug, info, Instrument};

use crate::conn::{self, Connection, KEEPALIVE_PERIOD};
use crate::error::{BoxError, Error, Result};
use crate::opts::{ClientConfig, ClientOption};
use crate::peer_id::PeerId;
use crate::pool::PooledChannel;
use crate::registry::Registry;
use crate::MAX_ID_LEN;

/// Pause after the listening socket fails to accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Listens for reverse-dialed sockets and turns them into channels on demand.
///
/// The accept loop runs until the client is dropped.
pub struct Client {
    registry: Arc<Registry>,
    local_addr: SocketAddr,
    acceptor: JoinHandle<()>,
}

impl Client {
    /// Bind `addr` and start accepting.
    pub async fn bind(addr: &str, opts: &[&dyn ClientOption]) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let registry = Arc::new(Registry::new(ClientConfig::from_options(opts)));

        let acceptor = tokio::spawn(accept_loop(listener, Arc::clone(&registry)));
        info!(bind_addr = %local_addr, "Reverse client listening");

        Ok(Self {
            registry,
            local_addr,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Acquire a channel to `peer_id`. See [`Registry::dial`].
    pub async fn dial(&self, peer_id: &str) -> Result<PooledChannel> {
        self.registry.dial(peer_id).await
    }

    /// Run `f` against every known peer. See [`Registry::each`].
    pub async fn each<F, Fut>(&self, f: F)
    where
        F: Fn(PeerId, Channel) -> Fut,
        Fut: Future<Output = std::result::Result<(), BoxError>>,
    {
        self.registry.each(f).await
    }

    /// Hand a channel back. See [`Registry::put`].
    pub async fn put(
        &self,
        channel: PooledChannel,
        error: Option<&(dyn std::error::Error + Send + Sync)>,
    ) -> Result<()> {
        self.registry.put(channel, error).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("local_addr", &self.local_addr)
            .field("registry", &self.registry)
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, registry: Arc<Registry>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let registry = Arc::clone(&registry);
                tokio::spawn(
                    async move {
                        if let Err(e) = handshake(stream, &registry).await {
                            log_event!(
                                registry.config().log,
                                warn,
                                "handshake with {} failed: {}",
                                peer_addr,
                                e
                            );
                        }
                    }
                    .instrument(tracing::info_span!("handshake", peer = %peer_addr)),
                );
            }
            Err(e) => {
                log_event!(registry.config().log, warn, "tcp accept failed: {}", e);
                sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Run accept hooks, read the PeerId frame and file the socket.
async fn handshake(stream: TcpStream, registry: &Registry) -> Result<()> {
    let config = registry.config();
    if let Err(e) = conn::set_keepalive(&stream, KEEPALIVE_PERIOD) {
        debug!(error = %e, "Failed to enable keep-alive");
    }

    let mut conn = Connection::from_tcp(stream);
    for hook in &config.accept_hooks {
        conn = timeout(config.handshake_timeout, hook.on_accept(conn))
            .await
            .unwrap_or_else(|_| Err(timed_out("accept hook")))?;
    }

    let mut frame = [0u8; MAX_ID_LEN];
    timeout(config.handshake_timeout, conn.read_exact(&mut frame))
        .await
        .unwrap_or_else(|_| Err(timed_out("peer id read")))?;
    let peer_id = PeerId::from_frame(&frame)?;

    debug!(
        peer_id = %peer_id,
        remote_addr = ?conn.peer_addr(),
        origin = ?conn.origin(),
        "Reverse connection registered"
    );
    registry.register(peer_id, conn).await;
    Ok(())
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out"))
}

static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();

fn default_client() -> Result<&'static Client> {
    DEFAULT_CLIENT.get().ok_or(Error::NotInitialized)
}

/// Bind the process-wide client used by [`dial`], [`each`] and [`put`].
///
/// Fails with [`Error::AlreadyInitialized`] on a second call.
pub async fn init_client(addr: &str, opts: &[&dyn ClientOption]) -> Result<()> {
    if DEFAULT_CLIENT.get().is_some() {
        return Err(Error::AlreadyInitialized);
    }
    let client = Client::bind(addr, opts).await?;
    DEFAULT_CLIENT
        .set(client)
        .map_err(|_| Error::AlreadyInitialized)
}

/// [`Client::dial`] on the process-wide client.
pub async fn dial(peer_id: &str) -> Result<PooledChannel> {
    default_client()?.dial(peer_id).await
}

/// [`Client::each`] on the process-wide client.
pub async fn each<F, Fut>(f: F) -> Result<()>
where
    F: Fn(PeerId, Channel) -> Fut,
    Fut: Future<Output = std::result::Result<(), BoxError>>,
{
    default_client()?.each(f).await;
    Ok(())
}

/// [`Client::put`] on the process-wide client.
pub async fn put(
    channel: PooledChannel,
    error: Option<&(dyn std::error::Error + Send + Sync)>,
) -> Result<()> {
    default_client()?.put(channel, error).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opts::{with_accept_hook, AcceptHook};
    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;

    async fn idle_sockets(client: &Client, peer_id: &str) -> usize {
        match client.registry().pool(peer_id) {
            Some(pool) => pool.idle_counts().await.0,
            None => 0,
        }
    }

    async fn wait_for_sockets(client: &Client, peer_id: &str, want: usize) {
        timeout(Duration::from_secs(2), async {
            while idle_sockets(client, peer_id).await < want {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn dial_in(client: &Client, frame: &[u8]) -> TcpStream {
        let mut stream = TcpStream::connect(client.local_addr()).await.unwrap();
        stream.write_all(frame).await.unwrap();
        stream
    }

    #[tokio::test]
    async fn test_registers_by_frame() {
        let client = Client::bind("127.0.0.1:0", &[]).await.unwrap();
        let frame = PeerId::new("edge-1").unwrap().to_frame();

        let _a = dial_in(&client, &frame).await;
        let _b = dial_in(&client, &frame).await;
        wait_for_sockets(&client, "edge-1", 2).await;

        assert_eq!(client.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_empty_and_short_frames() {
        let client = Client::bind("127.0.0.1:0", &[]).await.unwrap();

        let _empty = dial_in(&client, &[0u8; MAX_ID_LEN]).await;
        let short = dial_in(&client, b"edge").await;
        drop(short);

        sleep(Duration::from_millis(200)).await;
        assert!(client.registry().is_empty());
    }

    struct RejectAll;

    #[async_trait]
    impl AcceptHook for RejectAll {
        async fn on_accept(&self, _conn: Connection) -> io::Result<Connection> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "not allowed"))
        }
    }

    #[tokio::test]
    async fn test_failing_hook_drops_socket() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&seen);
        let log = crate::opts::with_log_func(move |msg| sink.lock().unwrap().push(msg.to_string()));
        let client = Client::bind("127.0.0.1:0", &[&with_accept_hook(RejectAll), &log])
            .await
            .unwrap();

        let _stream = dial_in(&client, &PeerId::new("edge-1").unwrap().to_frame()).await;
        sleep(Duration::from_millis(200)).await;

        assert!(client.registry().is_empty());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("not allowed"), "{}", seen[0]);
    }

    #[tokio::test]
    async fn test_unknown_peer_through_client() {
        let client = Client::bind("127.0.0.1:0", &[]).await.unwrap();
        assert!(matches!(
            client.dial("edge-1").await,
            Err(Error::NotFound(_))
        ));
    }
}

//! Configuration for both roles.
//!
//! Each option is a small record implementing [`ClientOption`],
//! [`ServerOption`], or both. Options are applied in order to a
//! [`ClientConfig`] / [`ServerConfig`] that starts from defaults:
//!
//! ```ignore
//! let client = Client::bind("0.0.0.0:50052", &[
//!     &with_proxy_protocol(),
//!     &with_dial_timeout(Duration::from_secs(3)),
//!     &with_log_func(|msg| eprintln!("{msg}")),
//! ]).await?;
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tonic::transport::{Channel, Endpoint};

use crate::active::{H2_PREFACE, TLS_HANDSHAKE};
use crate::conn::Connection;
use crate::error::BoxError;
use crate::proxy_protocol::parse_proxy_header;

/// Attempts `Pool::get` makes before giving up.
pub const DEFAULT_ACQUIRE_ATTEMPTS: usize = 10;

/// Wait between acquire attempts when no idle socket is available.
pub const DEFAULT_ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Deadline for the PeerId frame exchange on a fresh socket.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the reverse listener's outbound TCP connect.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a dialed socket may stay silent before the dial is recycled.
pub const DEFAULT_ACTIVATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Injected log sink.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Customises the tonic endpoint every pooled channel is built from.
pub type EndpointFn = Arc<dyn Fn(Endpoint) -> Endpoint + Send + Sync>;

/// Transforms a freshly accepted or dialed socket (TLS, PROXY parsing, ...).
///
/// An error aborts that one socket.
#[async_trait]
pub trait AcceptHook: Send + Sync + 'static {
    async fn on_accept(&self, conn: Connection) -> io::Result<Connection>;
}

/// Validates a freshly built channel before `Pool::get` hands it out.
///
/// An error drops the channel and `Pool::get` moves on to its next attempt.
#[async_trait]
pub trait ChannelCheck: Send + Sync + 'static {
    async fn check(&self, channel: &Channel) -> Result<(), BoxError>;
}

/// Forwards messages to the injected sink, if any.
#[derive(Clone, Default)]
pub(crate) struct Logger {
    sink: Option<LogSink>,
}

impl Logger {
    pub(crate) fn emit(&self, args: fmt::Arguments<'_>) {
        if let Some(sink) = &self.sink {
            sink(&args.to_string());
        }
    }
}

/// Passive-client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) log: Logger,
    /// Connect timeout handed to every pooled channel's endpoint.
    pub dial_timeout: Option<Duration>,
    /// Attempts `Pool::get` makes before failing with `NoConnection`.
    pub acquire_attempts: usize,
    /// Sleep between attempts while a pool has no idle socket.
    pub acquire_poll_interval: Duration,
    /// Deadline for reading the PeerId frame.
    pub handshake_timeout: Duration,
    pub(crate) endpoint_options: Vec<EndpointFn>,
    pub(crate) accept_hooks: Vec<Arc<dyn AcceptHook>>,
    pub(crate) channel_checks: Vec<Arc<dyn ChannelCheck>>,
}

impl ClientConfig {
    /// Defaults with `opts` applied in order.
    pub fn from_options(opts: &[&dyn ClientOption]) -> Self {
        let mut config = Self::default();
        for opt in opts {
            opt.apply_client(&mut config);
        }
        config
    }

    /// Build the endpoint a pooled channel connects through.
    pub(crate) fn endpoint(&self, endpoint: Endpoint) -> Endpoint {
        let endpoint = match self.dial_timeout {
            Some(timeout) => endpoint.connect_timeout(timeout),
            None => endpoint,
        };
        self.endpoint_options
            .iter()
            .fold(endpoint, |endpoint, apply| apply(endpoint))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log: Logger::default(),
            dial_timeout: None,
            acquire_attempts: DEFAULT_ACQUIRE_ATTEMPTS,
            acquire_poll_interval: DEFAULT_ACQUIRE_POLL_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            endpoint_options: Vec::new(),
            accept_hooks: Vec::new(),
            channel_checks: Vec::new(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("dial_timeout", &self.dial_timeout)
            .field("acquire_attempts", &self.acquire_attempts)
            .field("acquire_poll_interval", &self.acquire_poll_interval)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("endpoint_options", &self.endpoint_options.len())
            .field("accept_hooks", &self.accept_hooks.len())
            .field("channel_checks", &self.channel_checks.len())
            .finish()
    }
}

/// Reverse-listener configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub(crate) log: Logger,
    /// Deadline for each outbound TCP connect.
    pub dial_timeout: Duration,
    /// Deadline for writing the PeerId frame.
    pub handshake_timeout: Duration,
    /// Silence allowed on a pending connection before its read fails.
    pub activation_timeout: Duration,
    /// Byte patterns that mark a dialed socket as carrying real traffic.
    pub preambles: Vec<Bytes>,
    pub(crate) accept_hooks: Vec<Arc<dyn AcceptHook>>,
}

impl ServerConfig {
    /// Defaults with `opts` applied in order.
    pub fn from_options(opts: &[&dyn ServerOption]) -> Self {
        let mut config = Self::default();
        for opt in opts {
            opt.apply_server(&mut config);
        }
        config
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log: Logger::default(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            activation_timeout: DEFAULT_ACTIVATION_TIMEOUT,
            preambles: vec![
                Bytes::from_static(TLS_HANDSHAKE),
                Bytes::from_static(H2_PREFACE),
            ],
            accept_hooks: Vec::new(),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("dial_timeout", &self.dial_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("activation_timeout", &self.activation_timeout)
            .field("preambles", &self.preambles)
            .field("accept_hooks", &self.accept_hooks.len())
            .finish()
    }
}

/// Applies itself to a passive-client configuration.
pub trait ClientOption: Send + Sync {
    fn apply_client(&self, config: &mut ClientConfig);
}

/// Applies itself to a reverse-listener configuration.
pub trait ServerOption: Send + Sync {
    fn apply_server(&self, config: &mut ServerConfig);
}

/// Dial timeout for both roles.
#[derive(Debug, Clone, Copy)]
pub struct DialTimeout(pub Duration);

pub fn with_dial_timeout(timeout: Duration) -> DialTimeout {
    DialTimeout(timeout)
}

impl ClientOption for DialTimeout {
    fn apply_client(&self, config: &mut ClientConfig) {
        config.dial_timeout = Some(self.0);
    }
}

impl ServerOption for DialTimeout {
    fn apply_server(&self, config: &mut ServerConfig) {
        config.dial_timeout = self.0;
    }
}

/// Extra endpoint settings for pooled channels (timeouts, TLS, window sizes).
#[derive(Clone)]
pub struct EndpointOptions(EndpointFn);

pub fn with_endpoint<F>(f: F) -> EndpointOptions
where
    F: Fn(Endpoint) -> Endpoint + Send + Sync + 'static,
{
    EndpointOptions(Arc::new(f))
}

impl ClientOption for EndpointOptions {
    fn apply_client(&self, config: &mut ClientConfig) {
        config.endpoint_options.push(Arc::clone(&self.0));
    }
}

/// Appends a socket transform to the accept chain of either role.
#[derive(Clone)]
pub struct AcceptHookOption(Arc<dyn AcceptHook>);

pub fn with_accept_hook(hook: impl AcceptHook) -> AcceptHookOption {
    AcceptHookOption(Arc::new(hook))
}

impl ClientOption for AcceptHookOption {
    fn apply_client(&self, config: &mut ClientConfig) {
        config.accept_hooks.push(Arc::clone(&self.0));
    }
}

impl ServerOption for AcceptHookOption {
    fn apply_server(&self, config: &mut ServerConfig) {
        config.accept_hooks.push(Arc::clone(&self.0));
    }
}

/// Appends a post-construction check for pooled channels.
#[derive(Clone)]
pub struct ChannelCheckOption(Arc<dyn ChannelCheck>);

pub fn with_channel_check(check: impl ChannelCheck) -> ChannelCheckOption {
    ChannelCheckOption(Arc::new(check))
}

impl ClientOption for ChannelCheckOption {
    fn apply_client(&self, config: &mut ClientConfig) {
        config.channel_checks.push(Arc::clone(&self.0));
    }
}

/// Log sink for either role. Every message is also emitted through `tracing`.
#[derive(Clone)]
pub struct LogFunc(LogSink);

pub fn with_log_func<F>(f: F) -> LogFunc
where
    F: Fn(&str) + Send + Sync + 'static,
{
    LogFunc(Arc::new(f))
}

impl ClientOption for LogFunc {
    fn apply_client(&self, config: &mut ClientConfig) {
        config.log.sink = Some(Arc::clone(&self.0));
    }
}

impl ServerOption for LogFunc {
    fn apply_server(&self, config: &mut ServerConfig) {
        config.log.sink = Some(Arc::clone(&self.0));
    }
}

/// Installs PROXY v1/v2 parsing on the passive client's accept chain.
///
/// The parsed origin replaces the connection's peer IP (the port is kept).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyProtocol;

pub fn with_proxy_protocol() -> ProxyProtocol {
    ProxyProtocol
}

impl ClientOption for ProxyProtocol {
    fn apply_client(&self, config: &mut ClientConfig) {
        config.accept_hooks.push(Arc::new(ProxyProtocolHook));
    }
}

struct ProxyProtocolHook;

#[async_trait]
impl AcceptHook for ProxyProtocolHook {
    async fn on_accept(&self, conn: Connection) -> io::Result<Connection> {
        let (io, info) = conn.into_parts();
        let (stream, header) = parse_proxy_header(io).await?;

        let mut conn = Connection::with_io(stream, info);
        if let Some(origin) = header.origin {
            conn.set_origin(origin);
        }
        Ok(conn)
    }
}

/// Adds a byte pattern that activates a pending reverse connection.
#[derive(Debug, Clone)]
pub struct Preamble(pub Bytes);

pub fn with_preamble(preamble: impl Into<Bytes>) -> Preamble {
    Preamble(preamble.into())
}

impl ServerOption for Preamble {
    fn apply_server(&self, config: &mut ServerConfig) {
        if !self.0.is_empty() {
            config.preambles.push(self.0.clone());
        }
    }
}

/// Overrides how long a pending reverse connection may stay silent.
#[derive(Debug, Clone, Copy)]
pub struct ActivationTimeout(pub Duration);

pub fn with_activation_timeout(timeout: Duration) -> ActivationTimeout {
    ActivationTimeout(timeout)
}

impl ServerOption for ActivationTimeout {
    fn apply_server(&self, config: &mut ServerConfig) {
        config.activation_timeout = self.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_defaults() {
        let client = ClientConfig::default();
        assert_eq!(client.acquire_attempts, DEFAULT_ACQUIRE_ATTEMPTS);
        assert_eq!(client.acquire_poll_interval, DEFAULT_ACQUIRE_POLL_INTERVAL);
        assert!(client.dial_timeout.is_none());
        assert!(client.accept_hooks.is_empty());

        let server = ServerConfig::default();
        assert_eq!(server.dial_timeout, DEFAULT_DIAL_TIMEOUT);
        assert_eq!(server.activation_timeout, DEFAULT_ACTIVATION_TIMEOUT);
        assert_eq!(server.preambles.len(), 2);
    }

    #[test]
    fn test_options_apply_to_both_roles() {
        let timeout = with_dial_timeout(Duration::from_secs(3));
        let log = with_log_func(|_| {});

        let client = ClientConfig::from_options(&[&timeout, &log, &with_proxy_protocol()]);
        assert_eq!(client.dial_timeout, Some(Duration::from_secs(3)));
        assert!(client.log.sink.is_some());
        assert_eq!(client.accept_hooks.len(), 1);

        let server = ServerConfig::from_options(&[
            &timeout,
            &log,
            &with_preamble(&b"MAGIC"[..]),
            &with_activation_timeout(Duration::from_millis(250)),
        ]);
        assert_eq!(server.dial_timeout, Duration::from_secs(3));
        assert!(server.log.sink.is_some());
        assert_eq!(server.preambles.len(), 3);
        assert_eq!(server.activation_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_empty_preamble_ignored() {
        let server = ServerConfig::from_options(&[&with_preamble(Bytes::new())]);
        assert_eq!(server.preambles.len(), 2);
    }

    #[test]
    fn test_log_sink_receives_messages() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let config = ClientConfig::from_options(&[&with_log_func(move |msg| {
            sink.lock().unwrap().push(msg.to_string())
        })]);

        config.log.emit(format_args!("dial {} failed", "edge-1"));
        assert_eq!(seen.lock().unwrap().as_slice(), ["dial edge-1 failed"]);
    }

    #[tokio::test]
    async fn test_proxy_protocol_hook_rewrites_peer() {
        let (a, mut b) = tokio::io::duplex(256);
        tokio::io::AsyncWriteExt::write_all(
            &mut b,
            b"PROXY TCP4 203.0.113.7 10.0.0.1 5555 50052\r\nrest",
        )
        .await
        .unwrap();
        drop(b);

        let conn = Connection::with_io(
            a,
            crate::conn::ConnectionInfo {
                remote_addr: Some("10.0.0.9:41000".parse().unwrap()),
                ..Default::default()
            },
        );

        let mut conn = ProxyProtocolHook.on_accept(conn).await.unwrap();
        assert_eq!(conn.origin(), Some("203.0.113.7"));
        assert_eq!(conn.peer_addr(), Some("203.0.113.7:41000".parse().unwrap()));

        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"rest");
    }

    #[tokio::test]
    async fn test_proxy_protocol_hook_rejects_malformed() {
        let (a, mut b) = tokio::io::duplex(256);
        tokio::io::AsyncWriteExt::write_all(&mut b, b"PROXY TCP4 1.2.3.4\r\n")
            .await
            .unwrap();

        let err = ProxyProtocolHook
            .on_accept(Connection::new(a))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_endpoint_options_applied_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&calls);
        let second = Arc::clone(&calls);
        let config = ClientConfig::from_options(&[
            &with_endpoint(move |e| {
                first.lock().unwrap().push(1);
                e
            }),
            &with_endpoint(move |e| {
                second.lock().unwrap().push(2);
                e.tcp_nodelay(true)
            }),
        ]);

        let _ = config.endpoint(Endpoint::from_static("http://127.0.0.1:1"));
        assert_eq!(calls.lock().unwrap().as_slice(), [1, 2]);
    }
}

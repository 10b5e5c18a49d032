//! Reverse-dialed gRPC transport.
//!
//! A gRPC server that sits behind NAT or a firewall cannot be dialed by its
//! callers. `backdial` inverts the dial direction: the *server role* dials out
//! to the *client role*'s public listening port, and the client role keeps each
//! inbound socket as a transport for gRPC calls it initiates later.
//!
//! ## Architecture
//!
//! ```text
//!  server role (behind NAT)                    client role (public)
//!  ------------------------                    --------------------
//!  tonic Server                                Client::bind
//!    ^ serve_with_incoming                       | accept loop
//!  ReverseListener --- dial, PeerId frame -----> | accept hooks (PROXY v1/v2)
//!    | ActiveConnection (waits for preamble)     | read PeerId frame
//!                                                v
//!                                              Registry: PeerId -> Pool
//!                                                | Pool::get builds a tonic
//!                                                v Channel over the socket
//!                                              PooledChannel
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! // server role
//! let listener = ReverseListener::listen("gateway.example:50052", "edge-1", &[]).await?;
//! Server::builder()
//!     .add_service(my_service)
//!     .serve_with_incoming(listener.incoming())
//!     .await?;
//!
//! // client role
//! let client = Client::bind("0.0.0.0:50052", &[]).await?;
//! let channel = client.dial("edge-1").await?;
//! let result = call(channel.channel().clone()).await;
//! let failure = result.as_ref().err().map(|e| e as &(dyn std::error::Error + Send + Sync));
//! client.put(channel, failure).await?;
//! ```

/// Emit a `tracing` event and forward the same message to the injected log sink.
macro_rules! log_event {
    ($log:expr, $level:ident, $($arg:tt)+) => {{
        tracing::$level!($($arg)+);
        $log.emit(format_args!($($arg)+));
    }};
}

mod active;
mod client;
mod conn;
mod error;
mod listener;
mod opts;
mod peer_id;
mod pool;
pub mod proxy_protocol;
mod registry;
mod replay;
mod signal;
#[cfg(test)]
mod testing;

pub use active::{ActivationState, ActiveConnection, H2_PREFACE, TLS_HANDSHAKE};
pub use client::{dial, each, init_client, put, Client};
pub use conn::{Connection, ConnectionInfo, Io};
pub use error::{BoxError, Error, ProxyProtocolError, Result};
pub use listener::ReverseListener;
pub use opts::{
    with_accept_hook, with_activation_timeout, with_channel_check, with_dial_timeout,
    with_endpoint, with_log_func, with_preamble, with_proxy_protocol, AcceptHook,
    AcceptHookOption, ActivationTimeout, ChannelCheck, ChannelCheckOption, ClientConfig,
    ClientOption, DialTimeout, EndpointOptions, LogFunc, Preamble, ProxyProtocol, ServerConfig,
    ServerOption, DEFAULT_ACQUIRE_ATTEMPTS, DEFAULT_ACQUIRE_POLL_INTERVAL,
    DEFAULT_ACTIVATION_TIMEOUT, DEFAULT_DIAL_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use peer_id::PeerId;
pub use pool::{Pool, PooledChannel};
pub use proxy_protocol::{parse_proxy_header, ProxyHeader, ProxyVersion};
pub use registry::Registry;
pub use replay::Replay;

/// Width of the PeerId frame every reverse-dialed socket starts with.
pub const MAX_ID_LEN: usize = 32;

/// Idle slots reserved per pool; also sizes the reverse listener's delivery
/// channel (`MIN_IDLE - 1`).
pub const MIN_IDLE: usize = 4;

/// Upper bound of idle resources per pool. At most `MAX_IDLE - MIN_IDLE` idle
/// channels are kept.
pub const MAX_IDLE: usize = 16;

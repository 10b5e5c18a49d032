//! Error types for the reverse transport.

use std::io;

use thiserror::Error;

use crate::peer_id::PeerId;

/// Boxed error returned by user callbacks and hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by listeners, pools and the registry.
#[derive(Debug, Error)]
pub enum Error {
    /// The PeerId is empty.
    #[error("peer id cannot be empty")]
    EmptyPeerId,

    /// The PeerId does not fit the fixed-width frame.
    #[error("peer id '{id}' is too long: {len} bytes (max {max})")]
    PeerIdTooLong { id: String, len: usize, max: usize },

    /// A received PeerId frame could not be decoded.
    #[error("invalid peer id frame: {0}")]
    InvalidPeerIdFrame(&'static str),

    /// The address handed to a listener could not be resolved.
    #[error("invalid address '{address}': {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The reverse listener has been closed.
    #[error("listener has been stopped")]
    ListenerStopped,

    /// No usable connection appeared within the acquire budget.
    #[error("no connection to {0}")]
    NoConnection(PeerId),

    /// No pool is registered for the peer.
    #[error("connection point to {0} not found")]
    NotFound(String),

    /// Acquire failed for a known peer.
    #[error("dial {peer_id}: {source}")]
    Dial {
        peer_id: PeerId,
        #[source]
        source: Box<Error>,
    },

    /// A channel check rejected a freshly built channel.
    #[error("channel check failed: {0}")]
    ChannelCheck(#[source] BoxError),

    /// The process-wide default client has not been initialised.
    #[error("default client is not initialized")]
    NotInitialized,

    /// The process-wide default client was already initialised.
    #[error("default client is already initialized")]
    AlreadyInitialized,

    /// A PROXY protocol preamble was malformed.
    #[error(transparent)]
    ProxyProtocol(#[from] ProxyProtocolError),

    /// gRPC channel construction failed.
    #[error("grpc transport: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns true if the error means "nothing to talk to right now".
    pub fn is_unavailable(&self) -> bool {
        match self {
            Error::NoConnection(_) | Error::NotFound(_) => true,
            Error::Dial { source, .. } => source.is_unavailable(),
            _ => false,
        }
    }
}

/// Errors produced while parsing a PROXY protocol preamble.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyProtocolError {
    /// No CRLF within the maximum v1 header length.
    #[error("invalid proxy protocol v1: no CRLF within {max} bytes")]
    MissingTerminator { max: usize },

    /// The v1 line had the wrong number of fields.
    #[error("invalid proxy protocol v1: malformed header line")]
    Malformed,

    /// The v1 protocol token is not TCP4, TCP6 or UNKNOWN.
    #[error("invalid proxy protocol v1: unknown protocol '{0}'")]
    UnknownProtocol(String),

    /// The v2 address family nibble is not defined.
    #[error("invalid proxy protocol v2: unsupported address family 0x{0:02x}")]
    UnsupportedFamily(u8),

    /// The v2 declared length is smaller than the family's address block.
    #[error("invalid proxy protocol v2: address block of {actual} bytes, need {expected}")]
    AddressBlockTooShort { expected: usize, actual: usize },
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::ListenerStopped => io::Error::new(io::ErrorKind::NotConnected, err),
            other => io::Error::other(other),
        }
    }
}

impl From<ProxyProtocolError> for io::Error {
    fn from(err: ProxyProtocolError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        let peer = PeerId::new("edge-1").unwrap();
        assert!(Error::NoConnection(peer.clone()).is_unavailable());
        assert!(Error::NotFound("edge-2".into()).is_unavailable());
        assert!(Error::Dial {
            peer_id: peer,
            source: Box::new(Error::NoConnection(PeerId::new("edge-1").unwrap())),
        }
        .is_unavailable());
        assert!(!Error::ListenerStopped.is_unavailable());
    }

    #[test]
    fn test_messages() {
        let peer = PeerId::new("edge-1").unwrap();
        assert_eq!(Error::NoConnection(peer).to_string(), "no connection to edge-1");
        assert_eq!(
            Error::NotFound("edge-9".into()).to_string(),
            "connection point to edge-9 not found"
        );
        assert_eq!(
            ProxyProtocolError::UnsupportedFamily(0x40).to_string(),
            "invalid proxy protocol v2: unsupported address family 0x40"
        );
    }
}

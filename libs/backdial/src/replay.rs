//! Buffered-prefix stream decorator.
//!
//! Sniffing a preamble consumes bytes from the socket. [`Replay`] hands those
//! bytes back to the first reads before delegating to the wrapped stream, so
//! upper layers observe the stream as if nothing had been read.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// What happens once the replayed prefix is exhausted.
#[derive(Debug, Clone)]
enum Tail {
    /// Delegate to the inner stream.
    Passthrough,
    /// The inner stream already hit EOF while sniffing.
    Eof,
    /// The inner stream already failed while sniffing.
    Failed(io::ErrorKind, String),
}

/// A stream that replays already-consumed bytes before reading from `S`.
#[derive(Debug)]
pub struct Replay<S> {
    inner: S,
    prefix: Bytes,
    tail: Tail,
}

impl<S> Replay<S> {
    /// Replay `prefix`, then continue with `inner`.
    pub fn new(inner: S, prefix: impl Into<Bytes>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
            tail: Tail::Passthrough,
        }
    }

    /// Replay `prefix`, then report the error that ended sniffing.
    ///
    /// `UnexpectedEof` is reported as a clean EOF since the bytes that did
    /// arrive are replayed.
    pub fn with_terminal_error(inner: S, prefix: impl Into<Bytes>, err: io::Error) -> Self {
        let tail = match err.kind() {
            io::ErrorKind::UnexpectedEof => Tail::Eof,
            kind => Tail::Failed(kind, err.to_string()),
        };
        Self {
            inner,
            prefix: prefix.into(),
            tail,
        }
    }

    /// Bytes still waiting to be replayed.
    pub fn buffered(&self) -> &[u8] {
        &self.prefix
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Replay<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }

        let this = self.get_mut();
        match &this.tail {
            Tail::Passthrough => Pin::new(&mut this.inner).poll_read(cx, buf),
            Tail::Eof => Poll::Ready(Ok(())),
            Tail::Failed(kind, msg) => Poll::Ready(Err(io::Error::new(*kind, msg.clone()))),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Replay<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_prefix_then_inner() {
        let mut stream = Replay::new(&b" world"[..], Bytes::from_static(b"hello"));
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_prefix_served_across_small_reads() {
        let mut stream = Replay::new(&b""[..], Bytes::from_static(b"abcdef"));
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(stream.buffered(), b"ef");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_eof_becomes_clean_eof() {
        let err = io::Error::from(io::ErrorKind::UnexpectedEof);
        let mut stream =
            Replay::with_terminal_error(&b"never read"[..], Bytes::from_static(b"PRO"), err);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"PRO");
    }

    #[tokio::test]
    async fn test_terminal_error_after_prefix() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let mut stream = Replay::with_terminal_error(&b""[..], Bytes::from_static(b"ab"), err);
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}

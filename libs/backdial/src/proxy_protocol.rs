//! PROXY protocol v1/v2 preamble parsing.
//!
//! A relay in front of the passive client (HAProxy, a cloud load balancer)
//! prepends a PROXY header so the terminating side learns the address of the
//! peer that really dialed. [`parse_proxy_header`] strips that header off a
//! freshly accepted stream and reports the origin.
//!
//! Wire formats (HAProxy PROXY protocol):
//!
//! v1, one ASCII line of at most 107 bytes:
//! `PROXY <TCP4|TCP6|UNKNOWN> <src-ip> <dst-ip> <src-port> <dst-port>\r\n`
//!
//! v2, binary:
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length (big endian)
//! - variable: addresses and ports, then optional TLVs

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProxyProtocolError;
use crate::replay::Replay;

/// PROXY protocol v1 signature.
pub const PROXY_V1_SIGNATURE: &[u8] = b"PROXY ";

/// PROXY protocol v2 signature (12 bytes).
pub const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Longest possible v1 line:
/// `"PROXY UNKNOWN ffff:f...f:ffff ffff:f...f:ffff 65535 65535\r\n"`.
pub const MAX_V1_LEN: usize = 107;

/// Longest v2 header without TLVs: signature + ver/cmd + fam + len + unix block.
pub const MAX_V2_LEN: usize = 232;

/// Bytes sniffed before classifying: the v2 signature, or `"PROXY UNKNOW"`.
const SIGNATURE_LEN: usize = 12;

/// Fixed part of a v2 header.
const V2_HEADER_LEN: usize = 16;

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Address family: AF_UNSPEC.
const AF_UNSPEC: u8 = 0x00;

/// Address family: AF_INET (IPv4).
const AF_INET: u8 = 0x10;

/// Address family: AF_INET6 (IPv6).
const AF_INET6: u8 = 0x20;

/// Address family: AF_UNIX.
const AF_UNIX: u8 = 0x30;

/// Transport protocol: STREAM (TCP).
const TRANSPORT_STREAM: u8 = 0x01;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// Length of IPv6 address block (16 + 16 + 2 + 2 = 36 bytes).
const IPV6_ADDR_LEN: u16 = 36;

/// Length of AF_UNIX address block (108 + 108 = 216 bytes).
const UNIX_ADDR_LEN: u16 = 216;

/// Length of one AF_UNIX path in the address block.
const UNIX_PATH_LEN: usize = 108;

/// Which preamble a stream carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyVersion {
    V1,
    V2,
}

/// Outcome of sniffing a stream for a PROXY preamble.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Preamble version, `None` when the stream carried no header.
    pub version: Option<ProxyVersion>,
    /// Source address reported by the relay. IP text for TCP, the socket path
    /// for AF_UNIX; `None` for `UNKNOWN`/`AF_UNSPEC` or when no header was sent.
    pub origin: Option<String>,
    /// Header bytes stripped from the stream.
    pub consumed: usize,
}

impl ProxyHeader {
    fn absent() -> Self {
        Self::default()
    }

    /// The origin as an IP address, if it is one.
    pub fn origin_ip(&self) -> Option<IpAddr> {
        self.origin.as_deref().and_then(|o| o.parse().ok())
    }
}

/// Strip a PROXY v1/v2 header off `stream`.
///
/// Streams without a signature come back unchanged: the sniffed bytes are
/// replayed to the first reads. A stream that ends (or fails) before a header
/// could be classified is not a parse error either; its bytes are replayed and
/// the EOF or error is reported once they are drained. For v1, bytes read past
/// the CRLF are replayed too. v2 is length-delimited and never over-reads.
pub async fn parse_proxy_header<S>(
    mut stream: S,
) -> Result<(Replay<S>, ProxyHeader), ProxyProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_V1_LEN];
    let (n, err) = read_full(&mut stream, &mut buf[..SIGNATURE_LEN]).await;
    if let Some(err) = err {
        buf.truncate(n);
        return Ok((
            Replay::with_terminal_error(stream, buf, err),
            ProxyHeader::absent(),
        ));
    }

    if buf.starts_with(PROXY_V1_SIGNATURE) {
        parse_v1(stream, buf).await
    } else if buf[..SIGNATURE_LEN] == PROXY_V2_SIGNATURE {
        parse_v2(stream).await
    } else {
        buf.truncate(SIGNATURE_LEN);
        Ok((Replay::new(stream, buf), ProxyHeader::absent()))
    }
}

async fn parse_v1<S>(
    mut stream: S,
    mut buf: Vec<u8>,
) -> Result<(Replay<S>, ProxyHeader), ProxyProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut filled = SIGNATURE_LEN;
    let line_end = loop {
        if let Some(idx) = find_crlf(&buf[..filled]) {
            break idx;
        }
        if filled == MAX_V1_LEN {
            return Err(ProxyProtocolError::MissingTerminator { max: MAX_V1_LEN });
        }
        match stream.read(&mut buf[filled..]).await {
            Ok(0) => {
                buf.truncate(filled);
                let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
                return Ok((
                    Replay::with_terminal_error(stream, buf, eof),
                    ProxyHeader::absent(),
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                buf.truncate(filled);
                return Ok((
                    Replay::with_terminal_error(stream, buf, e),
                    ProxyHeader::absent(),
                ));
            }
        }
    };

    let fields: Vec<&[u8]> = buf[..line_end].split(|&b| b == b' ').collect();
    if fields.len() < 2 {
        return Err(ProxyProtocolError::Malformed);
    }

    let origin = match fields[1] {
        b"TCP4" | b"TCP6" => {
            if fields.len() != 6 {
                return Err(ProxyProtocolError::Malformed);
            }
            Some(String::from_utf8_lossy(fields[2]).into_owned())
        }
        b"UNKNOWN" => None,
        other => {
            return Err(ProxyProtocolError::UnknownProtocol(
                String::from_utf8_lossy(other).into_owned(),
            ))
        }
    };

    let consumed = line_end + 2;
    let rest = Bytes::copy_from_slice(&buf[consumed..filled]);
    Ok((
        Replay::new(stream, rest),
        ProxyHeader {
            version: Some(ProxyVersion::V1),
            origin,
            consumed,
        },
    ))
}

async fn parse_v2<S>(mut stream: S) -> Result<(Replay<S>, ProxyHeader), ProxyProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; V2_HEADER_LEN];
    header[..SIGNATURE_LEN].copy_from_slice(&PROXY_V2_SIGNATURE);

    let (n, err) = read_full(&mut stream, &mut header[SIGNATURE_LEN..]).await;
    if let Some(err) = err {
        let read = header[..SIGNATURE_LEN + n].to_vec();
        return Ok((
            Replay::with_terminal_error(stream, read, err),
            ProxyHeader::absent(),
        ));
    }

    let family = header[13] & 0xF0;
    let block_len = u16::from_be_bytes([header[14], header[15]]) as usize;

    let required = match family {
        AF_UNSPEC => 0,
        AF_INET => IPV4_ADDR_LEN as usize,
        AF_INET6 => IPV6_ADDR_LEN as usize,
        AF_UNIX => UNIX_ADDR_LEN as usize,
        other => return Err(ProxyProtocolError::UnsupportedFamily(other)),
    };
    if block_len < required {
        return Err(ProxyProtocolError::AddressBlockTooShort {
            expected: required,
            actual: block_len,
        });
    }

    let mut block = vec![0u8; block_len];
    let (n, err) = read_full(&mut stream, &mut block).await;
    if let Some(err) = err {
        let mut read = header.to_vec();
        read.extend_from_slice(&block[..n]);
        return Ok((
            Replay::with_terminal_error(stream, read, err),
            ProxyHeader::absent(),
        ));
    }

    let origin = match family {
        AF_INET => Some(Ipv4Addr::new(block[0], block[1], block[2], block[3]).to_string()),
        AF_INET6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&block[..16]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)).to_canonical().to_string())
        }
        AF_UNIX => {
            let path = &block[..UNIX_PATH_LEN];
            let end = path.iter().position(|&b| b == 0).unwrap_or(UNIX_PATH_LEN);
            Some(String::from_utf8_lossy(&path[..end]).into_owned())
        }
        // The receiver must ignore address information.
        _ => None,
    };

    Ok((
        Replay::new(stream, Bytes::new()),
        ProxyHeader {
            version: Some(ProxyVersion::V2),
            origin,
            consumed: V2_HEADER_LEN + block_len,
        },
    ))
}

/// Fill `buf` unless the stream ends or fails first; reports how much arrived.
async fn read_full<S>(stream: &mut S, buf: &mut [u8]) -> (usize, Option<io::Error>)
where
    S: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]).await {
            Ok(0) => return (filled, Some(io::ErrorKind::UnexpectedEof.into())),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (filled, Some(e)),
        }
    }
    (filled, None)
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

//! Peer identifiers and their fixed-width wire frame.

use std::borrow::Borrow;
use std::fmt;

use crate::error::Error;
use crate::MAX_ID_LEN;

/// Identifier a reverse-dialing peer presents so its sockets land in the right
/// pool.
///
/// Always non-empty and at most [`MAX_ID_LEN`] bytes of UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Validate and wrap an identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::EmptyPeerId);
        }
        if id.len() > MAX_ID_LEN {
            return Err(Error::PeerIdTooLong {
                len: id.len(),
                id,
                max: MAX_ID_LEN,
            });
        }
        // NUL is the padding byte; an embedded NUL would not survive the frame.
        if id.as_bytes().contains(&0) {
            return Err(Error::InvalidPeerIdFrame("peer id contains NUL"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Encode as a left-aligned, NUL-padded frame.
    pub fn to_frame(&self) -> [u8; MAX_ID_LEN] {
        let mut frame = [0u8; MAX_ID_LEN];
        frame[..self.0.len()].copy_from_slice(self.0.as_bytes());
        frame
    }

    /// Decode a frame read off the wire, trimming the NUL padding.
    pub fn from_frame(frame: &[u8; MAX_ID_LEN]) -> Result<Self, Error> {
        let end = frame
            .iter()
            .rposition(|&b| b != 0)
            .map(|i| i + 1)
            .ok_or(Error::InvalidPeerIdFrame("frame is all padding"))?;

        let id = std::str::from_utf8(&frame[..end])
            .map_err(|_| Error::InvalidPeerIdFrame("frame is not valid UTF-8"))?;
        Self::new(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for PeerId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for PeerId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

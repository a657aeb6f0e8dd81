//! Wire protocol types shared by both agent channels.
//!
//! Every message is a frame: a 6 byte ASCII header followed by the payload.
//!
//! ```text
//! +-----+-----------------+------------------------+
//! | tag | length (5 dec.) | payload (length bytes) |
//! +-----+-----------------+------------------------+
//!   c/o/i   00000..99999
//! ```
//!
//! Frames are never delimited by content: the receiver reads exactly
//! `length` bytes after the header before looking at the payload.

use std::fmt;
use std::io;

use bytes::{BufMut, Bytes, BytesMut};

/// Size of every frame header on the wire.
pub const HEADER_LEN: usize = 6;

/// Largest payload a 5 digit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = 99_999;

/// Kind of a frame, carried as the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Command text (`c`).
    Command,
    /// Captured command output (`o`).
    Output,
    /// Standard input for a pushed command (`i`).
    Input,
}

impl FrameKind {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Command => b'c',
            Self::Output => b'o',
            Self::Input => b'i',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'c' => Some(Self::Command),
            b'o' => Some(Self::Output),
            b'i' => Some(Self::Input),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Output => "output",
            Self::Input => "input",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Framing and protocol errors.
///
/// Every variant is fatal for the connection it occurs on: a desynchronized
/// stream cannot be repaired locally.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),

    #[error("malformed frame length {0:?}")]
    MalformedLength(String),

    #[error("payload of {len} bytes exceeds the {max} byte frame limit", max = MAX_PAYLOAD_LEN)]
    PayloadTooLarge { len: usize },

    #[error("expected {expected} frame, got {found}")]
    UnexpectedKind {
        expected: FrameKind,
        found: FrameKind,
    },

    /// Stream ended before the bytes promised by a header arrived.
    #[error("stream ended mid-frame with {buffered} bytes buffered")]
    Truncated { buffered: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    kind: FrameKind,
    len: usize,
}

impl FrameHeader {
    /// Header for a payload of `len` bytes. Fails if `len` does not fit in
    /// the length field.
    pub fn new(kind: FrameKind, len: usize) -> Result<Self, FrameError> {
        if len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge { len });
        }
        Ok(Self { kind, len })
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Render as tag byte plus zero-padded decimal length.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [b'0'; HEADER_LEN];
        out[0] = self.kind.tag();
        let mut n = self.len;
        for digit in out[1..].iter_mut().rev() {
            *digit = b'0' + (n % 10) as u8;
            n /= 10;
        }
        out
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<Self, FrameError> {
        let kind = FrameKind::from_tag(raw[0]).ok_or(FrameError::UnknownTag(raw[0]))?;
        let digits = &raw[1..];
        if !digits.iter().all(u8::is_ascii_digit) {
            return Err(FrameError::MalformedLength(
                String::from_utf8_lossy(digits).into_owned(),
            ));
        }
        let len = digits
            .iter()
            .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0'));
        Ok(Self { kind, len })
    }

    /// Reject the header unless it carries `kind`.
    pub fn expect_kind(self, kind: FrameKind) -> Result<Self, FrameError> {
        if self.kind != kind {
            return Err(FrameError::UnexpectedKind {
                expected: kind,
                found: self.kind,
            });
        }
        Ok(self)
    }
}

/// One tagged, length-prefixed unit of wire data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn command(text: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Command, text)
    }

    pub fn output(output: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Output, output)
    }

    pub fn input(input: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Input, input)
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn header(&self) -> Result<FrameHeader, FrameError> {
        FrameHeader::new(self.kind, self.payload.len())
    }

    /// Append header and payload to `dst`.
    ///
    /// The length check runs first, so an oversized payload leaves `dst`
    /// untouched.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let header = self.header()?;
        dst.reserve(HEADER_LEN + self.payload.len());
        dst.put_slice(&header.encode());
        dst.put_slice(&self.payload);
        Ok(())
    }
}

/// A coordinator-pushed execution request: the command text and the bytes
/// to feed to its standard input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    pub command: Bytes,
    pub input: Bytes,
}

impl CommandEnvelope {
    pub fn new(command: impl Into<Bytes>, input: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            input: input.into(),
        }
    }
}

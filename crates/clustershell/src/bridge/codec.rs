//! Framed codecs for the two agent channels.
//!
//! Both are `tokio_util` codecs so the channel handlers can drive sockets
//! through `Framed`. The codecs do no I/O themselves: they only split and
//! assemble buffered bytes.

use std::mem;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{CommandEnvelope, Frame, FrameError, FrameHeader, FrameKind, HEADER_LEN};

/// Encode a single frame into a fresh buffer.
///
/// Fails with [`FrameError::PayloadTooLarge`] before producing any bytes if
/// the payload does not fit the length field.
pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> Result<Bytes, FrameError> {
    let header = FrameHeader::new(kind, payload.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Parse the 6 byte header at the front of `raw`.
pub fn decode_header(raw: &[u8]) -> Result<FrameHeader, FrameError> {
    let header: &[u8; HEADER_LEN] = raw
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or(FrameError::Truncated {
            buffered: raw.len(),
        })?;
    FrameHeader::decode(header)
}

/// Consume a header from `src`. Caller guarantees `HEADER_LEN` bytes are buffered.
fn take_header(src: &mut BytesMut) -> Result<FrameHeader, FrameError> {
    let header = decode_header(src)?;
    src.advance(HEADER_LEN);
    Ok(header)
}

/// Codec for the shell-facing channel: one frame in, one frame out.
///
/// When built with [`FrameCodec::expecting`], any inbound frame of another
/// kind is a protocol error.
#[derive(Debug, Default)]
pub struct FrameCodec {
    expect: Option<FrameKind>,
    pending: Option<FrameHeader>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expecting(kind: FrameKind) -> Self {
        Self {
            expect: Some(kind),
            pending: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }
                let mut header = take_header(src)?;
                if let Some(kind) = self.expect {
                    header = header.expect_kind(kind)?;
                }
                tracing::trace!(kind = %header.kind(), len = header.len(), "Decoded frame header");
                self.pending = Some(header);
                header
            }
        };

        if src.len() < header.len() {
            src.reserve(header.len() - src.len());
            return Ok(None);
        }

        self.pending = None;
        let payload = src.split_to(header.len()).freeze();
        Ok(Some(Frame::new(header.kind(), payload)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.pending.is_none() => Ok(None),
            None => Err(FrameError::Truncated {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}

/// Where the request decoder is within one pushed command.
///
/// Headers arrive command first, bodies arrive input first.
#[derive(Debug, Default)]
enum RequestState {
    #[default]
    HeaderCommand,
    HeaderInput {
        command: FrameHeader,
    },
    BodyInput {
        command: FrameHeader,
        input: FrameHeader,
    },
    BodyCommand {
        command: FrameHeader,
        input: Bytes,
    },
}

/// Codec for the coordinator-facing channel.
///
/// Decodes a [`CommandEnvelope`] from the sequence
/// `header(c) header(i) body(input) body(command)` and encodes the reply
/// frame.
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    state: RequestState,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_idle(&self) -> bool {
        matches!(self.state, RequestState::HeaderCommand)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = CommandEnvelope;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            self.state = match mem::take(&mut self.state) {
                RequestState::HeaderCommand => {
                    if src.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let command = take_header(src)?.expect_kind(FrameKind::Command)?;
                    RequestState::HeaderInput { command }
                }
                RequestState::HeaderInput { command } => {
                    if src.len() < HEADER_LEN {
                        self.state = RequestState::HeaderInput { command };
                        return Ok(None);
                    }
                    let input = take_header(src)?.expect_kind(FrameKind::Input)?;
                    tracing::trace!(
                        command_len = command.len(),
                        input_len = input.len(),
                        "Decoded request headers"
                    );
                    RequestState::BodyInput { command, input }
                }
                RequestState::BodyInput { command, input } => {
                    if src.len() < input.len() {
                        src.reserve(input.len() + command.len() - src.len());
                        self.state = RequestState::BodyInput { command, input };
                        return Ok(None);
                    }
                    let input = src.split_to(input.len()).freeze();
                    RequestState::BodyCommand { command, input }
                }
                RequestState::BodyCommand { command, input } => {
                    if src.len() < command.len() {
                        src.reserve(command.len() - src.len());
                        self.state = RequestState::BodyCommand { command, input };
                        return Ok(None);
                    }
                    let command = src.split_to(command.len()).freeze();
                    return Ok(Some(CommandEnvelope { command, input }));
                }
            };
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(envelope) => Ok(Some(envelope)),
            None if src.is_empty() && self.is_idle() => Ok(None),
            None => Err(FrameError::Truncated {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<Frame> for EnvelopeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}

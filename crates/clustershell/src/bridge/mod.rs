//! Wire bridge between the agent and the coordinator.
//!
//! # Architecture
//!
//! - **protocol**: Frame kinds, headers, frames and the pushed command envelope
//! - **codec**: `tokio_util` codecs framing those types over any AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;

pub use codec::{EnvelopeCodec, FrameCodec, decode_header, encode_frame};
pub use protocol::{
    CommandEnvelope, Frame, FrameError, FrameHeader, FrameKind, HEADER_LEN, MAX_PAYLOAD_LEN,
};

//! Frame codec for the control socket.
//!
//! Uses LengthDelimitedCodec (4-byte big-endian length prefix) and hands the
//! raw frame bytes up unparsed. Envelope decoding happens in the dispatcher so
//! that a malformed frame is answered (or dropped) per message instead of
//! tearing down the stream.

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::config::DEFAULT_MAX_FRAME_BYTES;

/// Length-prefixed frame codec.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.inner.max_frame_length()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode(src)?.map(BytesMut::freeze))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        tracing::trace!(frame_size_bytes = item.len(), "Encoding frame");
        self.inner.encode(item, dst)
    }
}

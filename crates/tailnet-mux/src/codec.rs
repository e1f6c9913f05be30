//! tokio-util codec for multiplexer frames

use bytes::BytesMut;
use tailnet_proto::{Frame, MuxError};
use tokio_util::codec::{Decoder, Encoder};

/// Adapts [`Frame`] encoding to `FramedRead`/`FramedWrite`
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Frame::decode_from(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}

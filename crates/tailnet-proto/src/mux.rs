//! Multiplexing frame format
//!
//! Every logical stream on a session is carried as a sequence of frames with
//! a fixed 10 byte header: stream_id (4) + frame_type (1) + flags (1) +
//! length (4).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Stream identifier. Stream 0 is reserved for session-level frames.
pub type StreamId = u32;

/// Stream ID used for Ping, Pong and GoAway frames
pub const SESSION_STREAM_ID: StreamId = 0;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Payload for a logical stream; the first Data frame on a new ID opens it
    Data = 1,
    /// Sender has finished writing on this stream
    Close = 2,
    /// Abort the stream in both directions
    Reset = 3,
    /// Keepalive probe
    Ping = 4,
    /// Keepalive answer, echoing the Ping payload
    Pong = 5,
    /// Session shutting down
    GoAway = 6,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::Reset),
            4 => Ok(FrameType::Ping),
            5 => Ok(FrameType::Pong),
            6 => Ok(FrameType::GoAway),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const FIN: u8 = 0b0000_0001;
    pub const ACK: u8 = 0b0000_0010;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: stream_id (4) + frame_type (1) + flags (1) + length (4) = 10 bytes
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
            .with_flags(FrameFlags::new().with_fin())
    }

    pub fn reset(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Reset, Bytes::new())
    }

    pub fn ping(nonce: u64) -> Self {
        Self::new(
            SESSION_STREAM_ID,
            FrameType::Ping,
            Bytes::copy_from_slice(&nonce.to_be_bytes()),
        )
    }

    pub fn pong(payload: Bytes) -> Self {
        Self::new(SESSION_STREAM_ID, FrameType::Pong, payload)
            .with_flags(FrameFlags::new().with_ack())
    }

    pub fn go_away() -> Self {
        Self::new(SESSION_STREAM_ID, FrameType::GoAway, Bytes::new())
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Encode the frame into `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), MuxError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxError::FrameTooLarge(payload_len));
        }

        dst.reserve(Self::HEADER_SIZE + payload_len);
        dst.put_u32(self.stream_id);
        dst.put_u8(self.frame_type as u8);
        dst.put_u8(self.flags.as_u8());
        dst.put_u32(payload_len as u32);
        dst.put(self.payload.clone());

        Ok(())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, MuxError> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a frame from the front of a streaming buffer.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete frame; the
    /// buffer is left untouched in that case.
    pub fn decode_from(src: &mut BytesMut) -> Result<Option<Self>, MuxError> {
        if src.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..Self::HEADER_SIZE];
        let stream_id = header.get_u32();
        let frame_type = FrameType::try_from(header.get_u8())?;
        let flags = FrameFlags::from_u8(header.get_u8());
        let length = header.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(length as usize));
        }

        let total = Self::HEADER_SIZE + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(Self::HEADER_SIZE);
        let payload = src.split_to(length as usize).freeze();

        Ok(Some(Self {
            stream_id,
            frame_type,
            flags,
            payload,
        }))
    }
}

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

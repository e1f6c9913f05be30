//! Codec for encoding/decoding tailnet messages

use crate::messages::TailnetMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Tailnet message codec
pub struct TailnetCodec;

impl TailnetCodec {
    /// Maximum message size (1MB). DERP maps are the largest messages.
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    /// Encode a message to bytes
    ///
    /// Format: [length: u32][payload: bincode serialized message]
    pub fn encode(msg: &TailnetMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a message from bytes
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode(buf: &mut BytesMut) -> Result<Option<TailnetMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);

        let msg: TailnetMessage = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CoordinateRequest, Handshake, Node, PeerKind};
    use uuid::Uuid;

    fn handshake() -> TailnetMessage {
        TailnetMessage::CoordinateRequest(CoordinateRequest::Handshake(Handshake {
            peer_id: Uuid::new_v4(),
            kind: PeerKind::Client,
            name: "laptop".to_string(),
            auth_token: "token".to_string(),
            resume_token: None,
        }))
    }

    #[test]
    fn test_encode_decode() {
        let msg = handshake();

        let encoded = TailnetCodec::encode(&msg).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded = TailnetCodec::decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_incomplete() {
        let msg = TailnetMessage::CoordinateRequest(CoordinateRequest::UpdateSelf {
            node: Node {
                key: "nodekey:abc".to_string(),
                endpoints: vec!["10.0.0.1:41641".to_string()],
                ..Default::default()
            },
        });
        let encoded = TailnetCodec::encode(&msg).unwrap();

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(TailnetCodec::decode(&mut buf).unwrap(), None);

        // Provide rest of message
        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(TailnetCodec::decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_decode_back_to_back() {
        let first = handshake();
        let second = TailnetMessage::CoordinateRequest(CoordinateRequest::Disconnect);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&TailnetCodec::encode(&first).unwrap());
        buf.extend_from_slice(&TailnetCodec::encode(&second).unwrap());

        assert_eq!(TailnetCodec::decode(&mut buf).unwrap(), Some(first));
        assert_eq!(TailnetCodec::decode(&mut buf).unwrap(), Some(second));
        assert_eq!(TailnetCodec::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_rejects_oversized_length_header() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((TailnetCodec::MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            TailnetCodec::decode(&mut buf),
            Err(CodecError::MessageTooLarge(_))
        ));
    }
}

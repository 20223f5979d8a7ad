//! Framing: length-prefix (4 bytes LE) + bincode payload.

use crate::protocol::Message;

pub(crate) const LEN_SIZE: usize = 4;
/// Largest payload a frame may carry.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Turns messages into complete frames and frame payloads back into messages.
/// The framing must match the transport's decoder.
pub trait MessageCodec: Send + Sync {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, payload: &[u8]) -> Result<Message, CodecError>;
}

/// Length-prefixed bincode, paired with [`crate::decoder::LengthPrefixedDecoder`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl MessageCodec for BincodeCodec {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, CodecError> {
        encode_frame(msg)
    }

    fn decode(&self, payload: &[u8]) -> Result<Message, CodecError> {
        decode_payload(payload)
    }
}

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serialize(msg).map_err(CodecError::Encode)?;
    let len = payload.len();
    if len > MAX_FRAME_LEN as usize {
        return Err(CodecError::TooLarge(len));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + len);
    out.extend_from_slice(&(len as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode the payload of one frame (length prefix already stripped).
pub fn decode_payload(payload: &[u8]) -> Result<Message, CodecError> {
    bincode::deserialize(payload).map_err(CodecError::Decode)
}

/// Error turning a message into bytes or back.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("decode error: {0}")]
    Decode(#[source] bincode::Error),
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Control;

    #[test]
    fn frame_carries_length_prefix() {
        let msg = Message::store_file("file1", b"payload".to_vec());
        let frame = encode_frame(&msg).unwrap();
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - LEN_SIZE);
        assert_eq!(decode_payload(&frame[LEN_SIZE..]).unwrap(), msg);
    }

    #[test]
    fn control_and_data_decode_to_their_variants() {
        let codec = BincodeCodec;
        let ping = codec.encode(&Message::Control(Control::Ping)).unwrap();
        let data = codec.encode(&Message::store_file("k", vec![1, 2, 3])).unwrap();
        assert!(matches!(
            codec.decode(&ping[LEN_SIZE..]).unwrap(),
            Message::Control(Control::Ping)
        ));
        match codec.decode(&data[LEN_SIZE..]).unwrap() {
            Message::StoreFile { key, data } => {
                assert_eq!(key, "k");
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("expected StoreFile, got {:?}", other),
        }
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        assert!(matches!(
            decode_payload(&[0xff, 0xff, 0xff, 0xff, 0x01]),
            Err(CodecError::Decode(_))
        ));
        assert!(matches!(decode_payload(&[]), Err(CodecError::Decode(_))));
    }

    #[test]
    fn oversized_message_is_rejected() {
        let msg = Message::store_file("huge", vec![0u8; MAX_FRAME_LEN as usize + 1]);
        assert!(matches!(encode_frame(&msg), Err(CodecError::TooLarge(_))));
    }
}

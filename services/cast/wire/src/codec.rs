//! Encoding and decoding for the cast transport framing.
//!
//! Each message travels as a u32 big-endian length prefix followed by
//! the JSON envelope. The decoder consumes a growable read buffer and
//! yields complete messages as they become available.

use crate::message::CastMessage;
use crate::namespaces::MAX_FRAME_SIZE;
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the frame length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode a message into a length-prefixed frame
pub fn encode_message(message: &CastMessage) -> Result<Bytes, WireError> {
    let body = message.to_json()?;
    let total = LENGTH_PREFIX_SIZE + body.len();
    if total > MAX_FRAME_SIZE {
        return Err(WireError::FrameSize(total));
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Incremental frame decoder.
///
/// Feed bytes into a [`BytesMut`] and call [`FrameDecoder::decode`]
/// until it returns `Ok(None)`, meaning more data is needed.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    // Body length parsed from the prefix, pending until enough bytes arrive.
    pending_len: Option<usize>,
}

impl FrameDecoder {
    /// Create a new decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to decode one message from the buffer.
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial frame.
    /// An oversized length prefix is an error before any body bytes
    /// are buffered, so a hostile peer cannot force allocation.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<CastMessage>, WireError> {
        let body_len = match self.pending_len {
            Some(len) => len,
            None => {
                if buf.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                if LENGTH_PREFIX_SIZE + len > MAX_FRAME_SIZE {
                    return Err(WireError::FrameSize(LENGTH_PREFIX_SIZE + len));
                }
                buf.advance(LENGTH_PREFIX_SIZE);
                self.pending_len = Some(len);
                len
            }
        };

        if buf.len() < body_len {
            buf.reserve(body_len - buf.len());
            return Ok(None);
        }

        let body = buf.split_to(body_len);
        self.pending_len = None;
        CastMessage::from_json(&body).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespaces::{ENDPOINT_RECEIVER, ENDPOINT_SENDER, NS_HEARTBEAT};

    fn ping() -> CastMessage {
        CastMessage::text(
            ENDPOINT_SENDER,
            ENDPOINT_RECEIVER,
            NS_HEARTBEAT,
            r#"{"type":"PING"}"#,
        )
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let frame = encode_message(&ping()).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(frame.as_ref());
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, ping());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frames() {
        let frame = encode_message(&ping()).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        // Feed one byte at a time; only the last byte completes the frame.
        for (i, byte) in frame.iter().enumerate() {
            buf.put_u8(*byte);
            let result = decoder.decode(&mut buf).unwrap();
            if i + 1 < frame.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result.unwrap(), ping());
            }
        }
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let frame = encode_message(&ping()).unwrap();
        let mut buf = BytesMut::new();
        buf.put_slice(&frame);
        buf.put_slice(&frame);

        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE as u32);
        buf.put_slice(b"garbage");

        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WireError::FrameSize(_))
        ));
    }
}

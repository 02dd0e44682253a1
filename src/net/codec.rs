//! Peer message framing.
//!
//! Frames are a 4-byte big-endian length followed by a MessagePack-encoded
//! [`PeerMessage`]. Decoding is incremental: callers feed a growing buffer
//! and get back complete messages as they arrive.

use crate::core::error::{SluiceError, SluiceResult};
use crate::model::CaptureId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Upper bound on one frame's payload.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// A message exchanged between captures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMessage {
    /// Sending capture.
    pub from: CaptureId,
    /// Dispatch topic.
    pub topic: String,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

/// Encode one message as a length-prefixed frame.
pub fn encode_frame(message: &PeerMessage) -> SluiceResult<Bytes> {
    let body = rmp_serde::to_vec(message).map_err(SluiceError::marshal)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(SluiceError::PeerMessaging {
            message: format!("frame of {} bytes exceeds the limit", body.len()),
        });
    }
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Decode one message from the front of `buffer`, consuming it.
///
/// `Ok(None)` means more bytes are needed; the buffer is left intact.
pub fn decode_frame(buffer: &mut BytesMut) -> SluiceResult<Option<PeerMessage>> {
    if buffer.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(SluiceError::PeerMessaging {
            message: format!("frame of {len} bytes exceeds the limit"),
        });
    }
    if buffer.len() < 4 + len {
        return Ok(None);
    }
    buffer.advance(4);
    let body = buffer.split_to(len);
    let message = rmp_serde::from_slice(&body).map_err(SluiceError::marshal)?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> PeerMessage {
        PeerMessage {
            from: "cap-1".into(),
            topic: "dispatch".into(),
            payload: b"hello".to_vec(),
        }
    }

    #[test]
    fn frames_round_trip() {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&encode_frame(&message()).unwrap());
        let decoded = decode_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded, message());
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let frame = encode_frame(&message()).unwrap();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&frame[..frame.len() - 1]);
        assert!(decode_frame(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&frame[frame.len() - 1..]);
        assert!(decode_frame(&mut buffer).unwrap().is_some());
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut buffer = BytesMut::new();
        let first = message();
        let second = PeerMessage {
            from: "cap-2".into(),
            topic: "dispatch".into(),
            payload: b"again".to_vec(),
        };
        buffer.extend_from_slice(&encode_frame(&first).unwrap());
        buffer.extend_from_slice(&encode_frame(&second).unwrap());

        assert_eq!(decode_frame(&mut buffer).unwrap().unwrap(), first);
        assert_eq!(decode_frame(&mut buffer).unwrap().unwrap(), second);
        assert!(decode_frame(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buffer = BytesMut::new();
        buffer.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(decode_frame(&mut buffer).is_err());
    }
}

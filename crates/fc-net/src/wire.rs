//! Wire frame codec (§6): `[heartbeatFlag:u8][messageType:u16 BE][messageLength:u32 BE]`
//! followed by a UTF-8 JSON body. `FrameDecoder` buffers partial reads across multiple
//! socket reads and only yields a `Message` once a complete frame is in hand.

use bytes::{Buf, BytesMut};
use fc_common::{Message, MAX_FRAME_BODY_BYTES};
use thiserror::Error;

pub const HEADER_LEN: usize = 7;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid heartbeat flag byte: {0}")]
    InvalidHeartbeatFlag(u8),
    #[error("frame body length {0} exceeds the {1} byte maximum")]
    BodyTooLarge(u32, u32),
    #[error("frame body length must be at least 1 byte")]
    EmptyBody,
    #[error("frame body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("frame body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Encodes a header + JSON body into a single frame buffer, ready to be written whole.
pub fn encode_frame(heartbeat_flag: bool, message_type: u16, body: &serde_json::Value) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(body)?;
    let len = payload.len() as u32;
    if len == 0 {
        return Err(FrameError::EmptyBody);
    }
    if len > MAX_FRAME_BODY_BYTES {
        return Err(FrameError::BodyTooLarge(len, MAX_FRAME_BODY_BYTES));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(heartbeat_flag as u8);
    out.extend_from_slice(&message_type.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

struct Header {
    heartbeat_flag: bool,
    message_type: u16,
    length: u32,
}

fn parse_header(buf: &[u8]) -> Result<Header, FrameError> {
    let flag_byte = buf[0];
    let heartbeat_flag = match flag_byte {
        0 => false,
        1 => true,
        other => return Err(FrameError::InvalidHeartbeatFlag(other)),
    };
    let message_type = u16::from_be_bytes([buf[1], buf[2]]);
    let length = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]);
    if length == 0 {
        return Err(FrameError::EmptyBody);
    }
    if length > MAX_FRAME_BODY_BYTES {
        return Err(FrameError::BodyTooLarge(length, MAX_FRAME_BODY_BYTES));
    }
    Ok(Header { heartbeat_flag, message_type, length })
}

/// Incremental frame reassembly over a growing byte buffer fed by the connection's reader
/// loop (§4.D: "buffer truncated frames until complete").
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Feeds freshly-read bytes into the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempts to decode one complete frame from the buffered bytes. Returns `Ok(None)`
    /// when more bytes are needed; the header and body are left in the buffer for the next
    /// call rather than re-validated on every partial feed.
    pub fn try_decode(&mut self) -> Result<Option<Message>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = parse_header(&self.buf[..HEADER_LEN])?;
        let total = HEADER_LEN + header.length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        let body_bytes = self.buf.split_to(header.length as usize);
        let body_str = std::str::from_utf8(&body_bytes)?;
        let body: serde_json::Value = serde_json::from_str(body_str)?;
        Ok(Some(Message { heartbeat_flag: header.heartbeat_flag, message_type: header.message_type, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_then_decode_single_frame() {
        let body = json!({"foo": "bar"});
        let frame = encode_frame(false, 0x0101, &body).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame);
        let msg = decoder.try_decode().unwrap().unwrap();
        assert!(!msg.heartbeat_flag);
        assert_eq!(msg.message_type, 0x0101);
        assert_eq!(msg.body, body);
    }

    #[test]
    fn decode_waits_for_split_header() {
        let frame = encode_frame(true, 0x0f01, &json!({})).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame[..3]);
        assert!(decoder.try_decode().unwrap().is_none());
        decoder.feed(&frame[3..]);
        let msg = decoder.try_decode().unwrap().unwrap();
        assert!(msg.heartbeat_flag);
    }

    #[test]
    fn decode_waits_for_full_body() {
        let frame = encode_frame(false, 1, &json!({"x": 1})).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame[..HEADER_LEN + 2]);
        assert!(decoder.try_decode().unwrap().is_none());
        decoder.feed(&frame[HEADER_LEN + 2..]);
        assert!(decoder.try_decode().unwrap().is_some());
    }

    #[test]
    fn rejects_invalid_heartbeat_flag() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[2, 0, 1, 0, 0, 0, 1, b'1']);
        assert!(matches!(decoder.try_decode(), Err(FrameError::InvalidHeartbeatFlag(2))));
    }

    #[test]
    fn rejects_oversized_body_length() {
        let mut decoder = FrameDecoder::new();
        let mut frame = vec![0u8, 0, 1];
        frame.extend_from_slice(&(MAX_FRAME_BODY_BYTES + 1).to_be_bytes());
        decoder.feed(&frame);
        assert!(matches!(decoder.try_decode(), Err(FrameError::BodyTooLarge(_, _))));
    }

    #[test]
    fn decodes_two_frames_fed_back_to_back() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encode_frame(false, 1, &json!({"a": 1})).unwrap());
        decoder.feed(&encode_frame(false, 2, &json!({"b": 2})).unwrap());
        let first = decoder.try_decode().unwrap().unwrap();
        let second = decoder.try_decode().unwrap().unwrap();
        assert_eq!(first.message_type, 1);
        assert_eq!(second.message_type, 2);
    }
}

//! Canonical encoding primitives and frame buffering.
//!
//! Strings are a big-endian `u32` length followed by the bytes, booleans a
//! single byte, matching the SSH request-payload convention. Frames on the
//! control channel are a big-endian `u32` length followed by the body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Upper bound on a single control frame. Control payloads are tiny; anything
/// near this size is a broken or hostile peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("payload truncated")]
    Truncated,

    #[error("string field is not valid utf-8")]
    Utf8,

    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    Oversized(usize),
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

pub fn get_string(buf: &mut Bytes) -> Result<String, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::Utf8)
}

pub fn get_bool(buf: &mut Bytes) -> Result<bool, WireError> {
    if !buf.has_remaining() {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8() != 0)
}

/// Prefix a frame body with its length, ready to write to the channel.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Accumulates channel data and yields complete frames.
///
/// SSH delivers channel data in arbitrary chunks, so a frame may arrive split
/// across several `data` callbacks or several frames may arrive in one.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame body, or `None` if more data is needed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, WireError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(WireError::Oversized(len));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_roundtrip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "otter.example.com");
        put_string(&mut buf, "");

        let mut bytes = buf.freeze();
        assert_eq!(get_string(&mut bytes).unwrap(), "otter.example.com");
        assert_eq!(get_string(&mut bytes).unwrap(), "");
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn truncated_string_is_an_error() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "otter");
        let mut bytes = buf.freeze().slice(..4);
        assert_eq!(get_string(&mut bytes), Err(WireError::Truncated));
    }

    #[test]
    fn bool_roundtrip() {
        let mut buf = BytesMut::new();
        put_bool(&mut buf, true);
        put_bool(&mut buf, false);

        let mut bytes = buf.freeze();
        assert!(get_bool(&mut bytes).unwrap());
        assert!(!get_bool(&mut bytes).unwrap());
        assert_eq!(get_bool(&mut bytes), Err(WireError::Truncated));
    }

    #[test]
    fn frame_split_across_chunks() {
        let frame = encode_frame(b"hello");
        let mut fb = FrameBuffer::new();

        fb.extend(&frame[..3]);
        assert_eq!(fb.next_frame().unwrap(), None);

        fb.extend(&frame[3..]);
        assert_eq!(fb.next_frame().unwrap().unwrap().as_ref(), b"hello");
        assert_eq!(fb.next_frame().unwrap(), None);
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut data = encode_frame(b"one");
        data.extend_from_slice(&encode_frame(b"two"));

        let mut fb = FrameBuffer::new();
        fb.extend(&data);
        assert_eq!(fb.next_frame().unwrap().unwrap().as_ref(), b"one");
        assert_eq!(fb.next_frame().unwrap().unwrap().as_ref(), b"two");
        assert_eq!(fb.next_frame().unwrap(), None);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut fb = FrameBuffer::new();
        fb.extend(&((MAX_FRAME_LEN as u32 + 1).to_be_bytes()));
        assert!(matches!(fb.next_frame(), Err(WireError::Oversized(_))));
    }
}

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const LENGTH_FIELD_LEN: usize = 4;
pub const MAX_FRAME_LEN: u32 = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("invalid frame length: {0}")]
    InvalidLength(u32),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),

    #[error("unknown control type: {0}")]
    UnknownControl(u8),

    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("truncated frame body")]
    Truncated,

    #[error("invalid UTF-8 in frame body")]
    Utf8,
}

#[derive(Debug, Error)]
pub enum FrameEncodeError {
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("field too long: {0} bytes")]
    FieldTooLong(usize),
}

/// Encode one length-prefixed frame into the provided buffer.
#[inline]
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameEncodeError> {
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::PayloadTooLarge(payload.len()));
    }
    dst.reserve(LENGTH_FIELD_LEN + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Try to decode a single frame payload from the buffer.
///
/// Returns `Ok(None)` if there is not yet enough data for a full frame.
/// A zero or oversized length field is a protocol violation and terminates
/// the stream: the signed length header of older peers shows up here as a
/// length with the top bit set, which always exceeds the cap.
#[inline]
pub fn try_decode_frame(src: &mut BytesMut) -> Result<Option<Bytes>, FrameDecodeError> {
    if src.len() < LENGTH_FIELD_LEN {
        return Ok(None);
    }

    let mut length_bytes = &src[..LENGTH_FIELD_LEN];
    let frame_len = length_bytes.get_u32();

    if frame_len == 0 {
        return Err(FrameDecodeError::InvalidLength(frame_len));
    }

    if frame_len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::FrameTooLarge(frame_len));
    }

    let frame_len = frame_len as usize;
    if src.len() < LENGTH_FIELD_LEN + frame_len {
        return Ok(None);
    }

    src.advance(LENGTH_FIELD_LEN);
    Ok(Some(src.split_to(frame_len).freeze()))
}

/// `u16` length-prefixed UTF-8 string, shared by the control and envelope codecs.
pub(crate) fn put_string(dst: &mut BytesMut, s: &str) -> Result<(), FrameEncodeError> {
    let raw = s.as_bytes();
    let len = u16::try_from(raw.len()).map_err(|_| FrameEncodeError::FieldTooLong(raw.len()))?;
    dst.put_u16(len);
    dst.put_slice(raw);
    Ok(())
}

pub(crate) fn take_string(src: &mut &[u8]) -> Result<String, FrameDecodeError> {
    if src.remaining() < 2 {
        return Err(FrameDecodeError::Truncated);
    }
    let len = src.get_u16() as usize;
    if src.remaining() < len {
        return Err(FrameDecodeError::Truncated);
    }
    let raw = src.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameDecodeError::Utf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip_single() {
        let mut buf = BytesMut::new();
        encode_frame(b"hello hub", &mut buf).unwrap();

        let decoded = try_decode_frame(&mut buf)
            .unwrap()
            .expect("expected one complete frame");

        assert_eq!(&decoded[..], b"hello hub");
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encode_decode_roundtrip_pipelined() {
        let mut buf = BytesMut::new();
        encode_frame(b"first", &mut buf).unwrap();
        encode_frame(b"second", &mut buf).unwrap();

        let first = try_decode_frame(&mut buf).unwrap().expect("first frame");
        let second = try_decode_frame(&mut buf).unwrap().expect("second frame");

        assert_eq!(&first[..], b"first");
        assert_eq!(&second[..], b"second");
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn incomplete_buffer_returns_none() {
        let mut full = BytesMut::new();
        encode_frame(b"short", &mut full).unwrap();

        // Take only part of the encoded frame.
        let mut partial = full.split_to(3);
        assert!(try_decode_frame(&mut partial).unwrap().is_none());
    }

    #[test]
    fn zero_length_is_a_protocol_violation() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert!(matches!(
            try_decode_frame(&mut buf),
            Err(FrameDecodeError::InvalidLength(0))
        ));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        assert!(matches!(
            try_decode_frame(&mut buf),
            Err(FrameDecodeError::FrameTooLarge(_))
        ));

        // A "negative" signed length lands here as well.
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(matches!(
            try_decode_frame(&mut buf),
            Err(FrameDecodeError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn oversized_payload_is_rejected_on_encode() {
        let huge = vec![0u8; MAX_FRAME_LEN as usize + 1];
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_frame(&huge, &mut buf),
            Err(FrameEncodeError::PayloadTooLarge(_))
        ));
    }
}

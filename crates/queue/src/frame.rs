//! Normative on-disk frame layout (§4.4): a 4-byte little-endian length
//! prefix, a 1-byte type tag, the body, and a 4-byte CRC32C over
//! `tag || body`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Per-frame decode failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes remain than the declared frame needs.
    #[error("truncated frame")]
    Truncated,
    /// The trailing CRC32C did not match `tag || body`.
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

/// Frame type tag. Only one body shape exists today (a marshaled
/// event); the tag is kept byte-stable so future frame kinds (e.g. a
/// segment-local tombstone) can be added without breaking replay of
/// already-written segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Body is a marshaled `event::Event`.
    Event = 1,
}

/// Encodes one frame: `len(body) | tag | body | crc32c(tag||body)`.
pub fn encode(frame_type: FrameType, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + 1 + body.len() + 4);
    out.put_u32_le(body.len() as u32);
    out.put_u8(frame_type as u8);
    out.put_slice(body);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[frame_type as u8]);
    hasher.update(body);
    out.put_u32_le(hasher.finalize());
    out.freeze()
}

/// One decoded frame: its type tag and body, with the crc validated.
pub struct DecodedFrame {
    /// Raw type tag byte (kept raw so unknown future tags don't abort
    /// replay of the rest of a segment).
    pub frame_type: u8,
    /// Frame body.
    pub body: Bytes,
}

/// Attempts to decode one frame from the front of `buf`, advancing past
/// it on success. Returns `Ok(None)` if fewer bytes remain than a
/// length prefix needs (caller should stop, not treat as corruption).
pub fn decode(buf: &mut Bytes) -> Result<Option<DecodedFrame>, FrameError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let mut peek = buf.clone();
    let body_len = peek.get_u32_le() as usize;
    let needed = 1 + body_len + 4;
    if peek.len() < needed {
        return Ok(None);
    }

    let frame_type = peek.get_u8();
    let body = peek.copy_to_bytes(body_len);
    let stored_crc = peek.get_u32_le();

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[frame_type]);
    hasher.update(&body);
    if hasher.finalize() != stored_crc {
        return Err(FrameError::ChecksumMismatch);
    }

    // Commit: advance the real buffer by exactly what we consumed.
    buf.advance(4 + needed);
    Ok(Some(DecodedFrame { frame_type, body }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips() {
        let encoded = encode(FrameType::Event, b"hello");
        let mut buf = encoded;
        let decoded = decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Event as u8);
        assert_eq!(&decoded.body[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn detects_corruption() {
        let mut encoded = BytesMut::from(&encode(FrameType::Event, b"hello")[..]);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        let mut buf = encoded.freeze();
        assert_eq!(decode(&mut buf), Err(FrameError::ChecksumMismatch));
    }

    #[test]
    fn truncated_returns_none_not_error() {
        let encoded = encode(FrameType::Event, b"hello");
        let mut buf = encoded.slice(0..encoded.len() - 2);
        assert_eq!(decode(&mut buf).unwrap().map(|_| ()), None);
    }
}

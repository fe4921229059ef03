use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::kind::FrameKind;

/// Frame header: magic (2) + length (4) + kind (1) + reserved (1) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic bytes: "EW" (0x45 0x57).
pub const MAGIC: [u8; 2] = [0x45, 0x57];

/// Default maximum payload size: 64 MiB, room for a 4K BGRA frame.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Header plus payload.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Append a header for a payload of `len` bytes.
///
/// ```text
/// +-----------+-------------+--------+----------+-----------------+
/// | "EW" (2B) | length (4B) | kind   | reserved | payload         |
/// | 0x45 0x57 | LE u32      | (1B)   | (1B = 0) | (length bytes)  |
/// +-----------+-------------+--------+----------+-----------------+
/// ```
pub fn encode_header(kind: FrameKind, len: usize, dst: &mut BytesMut) -> Result<()> {
    let len32 = u32::try_from(len).map_err(|_| FrameError::PayloadTooLarge {
        size: len,
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE);
    dst.put_slice(&MAGIC);
    dst.put_u32_le(len32);
    dst.put_u8(kind.as_u8());
    dst.put_u8(0);
    Ok(())
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` until a whole frame is buffered; on success the frame's
/// bytes are consumed. Header errors are reported as soon as the header is
/// complete, before the payload arrives.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let payload_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    let kind = FrameKind::from_u8(src[6]).ok_or(FrameError::UnknownKind(src[6]))?;
    if src[7] != 0 {
        return Err(FrameError::ReservedByte(src[7]));
    }

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();
    Ok(Some(Frame { kind, payload }))
}

/// Frame-layer limits and timeouts.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest payload accepted or sent. Default: 64 MiB.
    pub max_payload_size: usize,
    /// Read timeout applied to the stream. `None` blocks indefinitely.
    pub read_timeout: Option<Duration>,
    /// Write timeout applied to the stream.
    pub write_timeout: Option<Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl FrameConfig {
    pub fn with_max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(kind: FrameKind, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_header(kind, payload.len(), &mut buf).unwrap();
        buf.put_slice(payload);
        buf
    }

    #[test]
    fn header_layout() {
        let buf = encode(FrameKind::Notify, b"abc");
        assert_eq!(&buf[..], &[0x45, 0x57, 3, 0, 0, 0, 2, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn decode_consumes_exactly_one_frame() {
        let mut buf = encode(FrameKind::Call, b"first");
        buf.extend_from_slice(&encode(FrameKind::Reply, b"second"));

        let first = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(first, Frame::new(FrameKind::Call, &b"first"[..]));

        let second = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(second.kind, FrameKind::Reply);
        assert_eq!(second.payload.as_ref(), b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_header_and_payload_wait_for_more() {
        let mut short_header = BytesMut::from(&MAGIC[..]);
        assert!(decode_frame(&mut short_header, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .is_none());

        let mut partial = encode(FrameKind::Reply, b"pixels");
        partial.truncate(HEADER_SIZE + 2);
        assert!(decode_frame(&mut partial, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .is_none());
        assert_eq!(partial.len(), HEADER_SIZE + 2);
    }

    #[test]
    fn empty_payload() {
        let mut buf = encode(FrameKind::Control, b"");
        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Control);
        assert!(frame.payload.is_empty());
        assert_eq!(frame.wire_size(), HEADER_SIZE);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = BytesMut::from(&[0x49, 0x50, 0, 0, 0, 0, 1, 0][..]);
        assert!(matches!(
            decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD),
            Err(FrameError::InvalidMagic)
        ));
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut buf = BytesMut::from(&[0x45, 0x57, 0, 0, 0, 0, 9, 0][..]);
        assert!(matches!(
            decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD),
            Err(FrameError::UnknownKind(9))
        ));
    }

    #[test]
    fn rejects_nonzero_reserved_byte() {
        let mut buf = BytesMut::from(&[0x45, 0x57, 0, 0, 0, 0, 1, 7][..]);
        assert!(matches!(
            decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD),
            Err(FrameError::ReservedByte(7))
        ));
    }

    #[test]
    fn rejects_oversize_before_payload_arrives() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(1024);
        buf.put_u8(FrameKind::Reply.as_u8());
        buf.put_u8(0);

        assert!(matches!(
            decode_frame(&mut buf, 512),
            Err(FrameError::PayloadTooLarge {
                size: 1024,
                max: 512
            })
        ));
    }

    #[test]
    fn default_cap_fits_4k_bgra_frame() {
        assert!(3840 * 2160 * 4 <= DEFAULT_MAX_PAYLOAD);
    }
}

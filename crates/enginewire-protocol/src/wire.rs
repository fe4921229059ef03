//! Primitive encoders and a bounds-checked decoder cursor.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CodecError, Result};

/// Write a `u32` length prefix followed by the UTF-8 bytes.
pub fn put_str(dst: &mut BytesMut, value: &str) {
    put_len(dst, value.len());
    dst.put_slice(value.as_bytes());
}

/// Write a `u32` count followed by each value.
pub fn put_i32_array(dst: &mut BytesMut, values: &[i32]) {
    put_len(dst, values.len());
    for v in values {
        dst.put_i32_le(*v);
    }
}

/// Write a `u32` length prefix followed by raw bytes.
pub fn put_bytes(dst: &mut BytesMut, value: &[u8]) {
    put_len(dst, value.len());
    dst.put_slice(value);
}

pub fn put_bool(dst: &mut BytesMut, value: bool) {
    dst.put_u8(u8::from(value));
}

fn put_len(dst: &mut BytesMut, len: usize) {
    // Frames are capped far below 4 GiB, so a longer field can never be sent.
    debug_assert!(len <= u32::MAX as usize);
    dst.put_u32_le(len as u32);
}

/// Cursor over one message payload.
///
/// Every getter checks the remaining length before touching the buffer, so
/// decoding hostile input fails with [`CodecError`] instead of panicking or
/// allocating according to a bogus length.
pub struct WireReader {
    buf: Bytes,
    pos: usize,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, field: &'static str, needed: usize) -> Result<&[u8]> {
        if needed > self.remaining() {
            return Err(CodecError::Truncated {
                field,
                offset: self.pos,
                needed,
                available: self.remaining(),
            });
        }
        let start = self.pos;
        self.pos += needed;
        Ok(&self.buf[start..self.pos])
    }

    fn take_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(field, N)?);
        Ok(out)
    }

    pub fn u8(&mut self, field: &'static str) -> Result<u8> {
        Ok(self.take_array::<1>(field)?[0])
    }

    pub fn u32(&mut self, field: &'static str) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array(field)?))
    }

    pub fn u64(&mut self, field: &'static str) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array(field)?))
    }

    pub fn i32(&mut self, field: &'static str) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array(field)?))
    }

    pub fn f32(&mut self, field: &'static str) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take_array(field)?))
    }

    pub fn f64(&mut self, field: &'static str) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take_array(field)?))
    }

    pub fn bool(&mut self, field: &'static str) -> Result<bool> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidDiscriminant {
                field,
                value: u32::from(other),
            }),
        }
    }

    pub fn string(&mut self, field: &'static str) -> Result<String> {
        let len = self.u32(field)? as usize;
        let raw = self.take(field, len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8 { field })
    }

    pub fn i32_array(&mut self, field: &'static str) -> Result<Vec<i32>> {
        let count = self.u32(field)? as usize;
        let needed = count.checked_mul(4).unwrap_or(usize::MAX);
        let raw = self.take(field, needed)?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Length-prefixed bytes, returned as a zero-copy slice of the payload.
    pub fn bytes(&mut self, field: &'static str) -> Result<Bytes> {
        let len = self.u32(field)? as usize;
        let start = self.pos;
        self.take(field, len)?;
        Ok(self.buf.slice(start..start + len))
    }

    /// Fail if anything is left after the message.
    pub fn finish(&self, family: &'static str) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            count => Err(CodecError::TrailingBytes { family, count }),
        }
    }
}

//! Low-level encoding primitives and the frame header.
//!
//! All multi-byte integers are little-endian. Strings and byte blobs are
//! length-prefixed with a u32. Vectors are a u32 element count followed by
//! the elements. These primitives are deliberately dumb; the message layer
//! in [`crate::messages`] composes them.

use crate::{WireError, WireResult};

/// Size of the fixed frame header: 4-byte kind + 4-byte body length.
pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on a frame body. A corrupt length prefix must not be able to
/// drive an unbounded allocation.
pub const MAX_BODY_LEN: u32 = 64 * 1024 * 1024;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw message kind discriminant.
    pub kind: u32,
    /// Body length in bytes.
    pub body_len: u32,
}

impl FrameHeader {
    /// Encode into the fixed 8-byte representation.
    pub fn to_bytes(self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.kind.to_le_bytes());
        buf[4..8].copy_from_slice(&self.body_len.to_le_bytes());
        buf
    }

    /// Decode from the fixed 8-byte representation, rejecting oversized
    /// body lengths.
    pub fn from_bytes(buf: &[u8; FRAME_HEADER_LEN]) -> WireResult<Self> {
        let kind = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let body_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if body_len > MAX_BODY_LEN {
            return Err(WireError::LengthOutOfBounds {
                len: body_len as u64,
                limit: MAX_BODY_LEN as u64,
            });
        }
        Ok(FrameHeader { kind, body_len })
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append-only encoder over a growable byte buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Consume the writer, returning the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    /// Length-prefixed byte blob.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    /// Length-prefixed UTF-8 string.
    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    /// u32 element count followed by per-element encoding.
    pub fn put_seq<T>(&mut self, items: &[T], mut encode: impl FnMut(&mut Self, &T)) {
        self.put_u32(items.len() as u32);
        for item in items {
            encode(self, item);
        }
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Cursor-based decoder over a byte slice.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Wrap a byte slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(self) -> WireResult<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }

    fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n - self.remaining(),
                offset: self.pos,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> WireResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> WireResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_bool(&mut self) -> WireResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Length-prefixed byte blob. The length is bounded by the bytes that
    /// are actually present, so a corrupt prefix fails instead of allocating.
    pub fn get_bytes(&mut self) -> WireResult<Vec<u8>> {
        let len = self.get_u32()? as usize;
        if len > self.remaining() {
            return Err(WireError::LengthOutOfBounds {
                len: len as u64,
                limit: self.remaining() as u64,
            });
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Length-prefixed UTF-8 string.
    pub fn get_str(&mut self) -> WireResult<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
    }

    /// u32 element count followed by per-element decoding.
    pub fn get_seq<T>(
        &mut self,
        mut decode: impl FnMut(&mut Self) -> WireResult<T>,
    ) -> WireResult<Vec<T>> {
        let count = self.get_u32()? as usize;
        // Each element takes at least one byte; reject counts the buffer
        // cannot possibly satisfy.
        if count > self.remaining() {
            return Err(WireError::LengthOutOfBounds {
                len: count as u64,
                limit: self.remaining() as u64,
            });
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(decode(self)?);
        }
        Ok(items)
    }
}

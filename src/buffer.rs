//! Growable byte buffer used by the codec
//!
//! A single cursor (`head`) serves as the write position while encoding and
//! as the read position while decoding. Capacity doubles on demand and never
//! shrinks.
//!
//! # Varints
//!
//! Unsigned 32-bit integers are written base-128, least-significant group
//! first, with the high bit of each byte set when more bytes follow:
//! ```text
//! 300 -> [0xAC, 0x02]
//! ```

use crate::error::CodecError;

/// Capacity used when a buffer is created without a size hint
pub const DEFAULT_CAPACITY: usize = 128;

/// Longest valid encoding of a u32
const MAX_VARINT_LEN: usize = 5;

#[derive(Debug, Clone)]
pub struct Buffer {
    base: Vec<u8>,
    head: usize,
    /// End of initialized data; reads never go past it
    len: usize,
}

impl Buffer {
    /// Create an empty buffer with at least `capacity` bytes reserved
    pub fn with_capacity(capacity: usize) -> Self {
        let size = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        Buffer {
            base: vec![0; size],
            head: 0,
            len: 0,
        }
    }

    /// Create a buffer holding a copy of `data`, cursor at the start
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut buf = Buffer::with_capacity(data.len());
        buf.base[..data.len()].copy_from_slice(data);
        buf.len = data.len();
        buf
    }

    pub fn capacity(&self) -> usize {
        self.base.len()
    }

    /// Current cursor offset
    pub fn position(&self) -> usize {
        self.head
    }

    /// Bytes left between the cursor and the end of written data
    pub fn remaining(&self) -> usize {
        self.len - self.head
    }

    /// Grow (doubling) until `n` more bytes fit after the cursor
    pub fn ensure(&mut self, n: usize) {
        let need = self.head + n;
        let mut size = self.base.len().max(1);
        while size < need {
            size *= 2;
        }
        if size > self.base.len() {
            self.base.resize(size, 0);
        }
    }

    pub fn put(&mut self, byte: u8) {
        self.ensure(1);
        self.base[self.head] = byte;
        self.advance_write(1);
    }

    pub fn write(&mut self, data: &[u8]) {
        self.ensure(data.len());
        self.base[self.head..self.head + data.len()].copy_from_slice(data);
        self.advance_write(data.len());
    }

    pub fn write_varint(&mut self, mut val: u32) {
        self.ensure(MAX_VARINT_LEN);
        while val >= 0x80 {
            self.put((val & 0x7f) as u8 | 0x80);
            val >>= 7;
        }
        self.put(val as u8);
    }

    fn advance_write(&mut self, n: usize) {
        self.head += n;
        if self.head > self.len {
            self.len = self.head;
        }
    }

    /// Read one byte and advance
    pub fn get(&mut self) -> Result<u8, CodecError> {
        let byte = self.peek()?;
        self.head += 1;
        Ok(byte)
    }

    /// Inspect the next byte without advancing
    pub fn peek(&self) -> Result<u8, CodecError> {
        if self.head >= self.len {
            return Err(CodecError::truncated(self.head, 1));
        }
        Ok(self.base[self.head])
    }

    /// Borrow the next `n` bytes and advance past them
    pub fn read(&mut self, n: usize) -> Result<&[u8], CodecError> {
        if n > self.remaining() {
            return Err(CodecError::truncated(self.head, n));
        }
        let start = self.head;
        self.head += n;
        Ok(&self.base[start..start + n])
    }

    pub fn read_varint(&mut self) -> Result<u32, CodecError> {
        let start = self.head;
        let mut val: u32 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.get()?;
            let group = u32::from(byte & 0x7f);
            let shift = 7 * i as u32;
            if i == MAX_VARINT_LEN - 1 && group > 0x0f {
                return Err(CodecError::malformed(start, "varint overflows 32 bits"));
            }
            val |= group << shift;
            if byte < 0x80 {
                return Ok(val);
            }
        }
        Err(CodecError::malformed(start, "varint longer than 5 bytes"))
    }

    /// Rewind the cursor to the start, keeping written data readable
    pub fn rewind(&mut self) {
        self.head = 0;
    }

    /// The written bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.base[..self.len]
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        self.base.truncate(self.len);
        self.base
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::with_capacity(DEFAULT_CAPACITY)
    }
}

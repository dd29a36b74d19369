//! Bounds-checked reading of datagram payloads
//!
//! Codecs never index into a received buffer directly. Every read goes through
//! [`WireCursor`], which checks the remaining length before touching a byte and
//! reports a [`WireError`] instead of reading past the end. Strings are only
//! accepted when their NUL terminator lies inside the buffer.

use thiserror::Error;

/// Failures raised while decoding a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// A fixed-width read ran past the end of the buffer.
    #[error("truncated packet: needed {needed} bytes at offset {offset}, {remaining} remaining")]
    Truncated {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    /// A string started at `offset` but no terminator was found before the end.
    #[error("unterminated string at offset {offset}")]
    Unterminated { offset: usize },
    /// A fixed marker did not match.
    #[error("unexpected bytes at offset {offset}: expected {expected:02X?}, got {actual:02X?}")]
    Mismatch {
        offset: usize,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },
}

/// Read cursor over a borrowed payload.
#[derive(Debug, Clone)]
pub struct WireCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current read offset from the start of the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unread bytes, without consuming them.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Next byte without consuming it.
    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Consumes and returns the next `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(WireError::Truncated {
                offset: self.pos,
                needed: len,
                remaining: self.remaining(),
            });
        }

        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), WireError> {
        self.read_bytes(len).map(|_| ())
    }

    /// Consumes everything that is left.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Consumes `marker` or fails without moving the cursor.
    pub fn expect(&mut self, marker: &[u8]) -> Result<(), WireError> {
        let offset = self.pos;
        let actual = self.read_bytes(marker.len())?;

        if actual != marker {
            self.pos = offset;
            return Err(WireError::Mismatch {
                offset,
                expected: marker.to_vec(),
                actual: actual.to_vec(),
            });
        }

        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32_be(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32_le(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    /// Reads bytes up to (not including) `delim` and consumes the delimiter.
    ///
    /// The delimiter must be present inside the buffer; running into the end
    /// first is [`WireError::Unterminated`].
    pub fn read_until(&mut self, delim: u8) -> Result<&'a [u8], WireError> {
        let start = self.pos;

        match self.buf[start..].iter().position(|&b| b == delim) {
            Some(len) => {
                self.pos = start + len + 1;
                Ok(&self.buf[start..start + len])
            }
            None => Err(WireError::Unterminated { offset: start }),
        }
    }

    /// Reads a NUL-terminated string, decoding invalid UTF-8 lossily.
    pub fn read_cstring(&mut self) -> Result<String, WireError> {
        self.read_until(0x00)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

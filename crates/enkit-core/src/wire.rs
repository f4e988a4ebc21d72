//! Streaming primitives for the protobuf wire format.
//!
//! Export and signature files are protobuf messages, but the export
//! reader cannot afford to materialize a whole key batch up front: key
//! iteration is lazy and the metadata pass rewinds. This module provides
//! the forward-only field reader that both build on, plus the minimal
//! writer the export writer and tests use. Complete sub-messages (key
//! records, signature records) are handed off to `prost`-derived types;
//! only the outer stream is framed here.
//!
//! Framing failures are split three ways so callers can tell truncated
//! input from corrupt input: [`WireError::Underrun`] when the stream ends
//! inside a primitive, [`WireError::Overrun`] when a declared length
//! exceeds the bytes that remain, and [`WireError::Range`] when a varint
//! is malformed or does not fit its target type.

use thiserror::Error;

/// Protobuf wire types understood by the stream reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    /// Base-128 varint.
    Varint,
    /// Little-endian 8-byte value.
    Fixed64,
    /// Length-prefixed byte string.
    LengthDelimited,
    /// Little-endian 4-byte value.
    Fixed32,
}

impl WireType {
    fn from_key(value: u64) -> Result<Self, WireError> {
        match value & 0x7 {
            0 => Ok(Self::Varint),
            1 => Ok(Self::Fixed64),
            2 => Ok(Self::LengthDelimited),
            5 => Ok(Self::Fixed32),
            other => Err(WireError::BadFormat {
                reason: format!("unsupported wire type {other}"),
            }),
        }
    }
}

/// Errors produced while framing a length-delimited record stream.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WireError {
    /// The stream ended in the middle of a primitive.
    #[error("field extends past end of data")]
    Underrun,

    /// A declared length exceeds the bytes remaining in the stream.
    #[error("declared length {declared} exceeds {remaining} remaining bytes")]
    Overrun {
        /// Length announced by the frame.
        declared: u64,
        /// Bytes actually left in the stream.
        remaining: usize,
    },

    /// A varint was malformed or out of range for its target type.
    #[error("varint out of range")]
    Range,

    /// The stream is structurally not a protobuf record sequence.
    #[error("malformed stream: {reason}")]
    BadFormat {
        /// What failed to parse.
        reason: String,
    },
}

/// Forward-only field reader over an in-memory record stream.
#[derive(Debug, Clone)]
pub struct StreamReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> StreamReader<'a> {
    /// Creates a reader over `buf`, positioned at its start.
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current byte offset into the stream.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Restores a position previously obtained from [`Self::position`].
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Underrun`] if `pos` lies past the end of the
    /// stream.
    pub fn set_position(&mut self, pos: usize) -> Result<(), WireError> {
        if pos > self.buf.len() {
            return Err(WireError::Underrun);
        }
        self.pos = pos;
        Ok(())
    }

    /// Bytes left in the stream.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether the reader has consumed the whole stream.
    #[must_use]
    pub const fn is_at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Reads the next field key, or `None` at a clean end of stream.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] if the key varint is malformed, the tag is
    /// zero, or the wire type is unknown.
    pub fn read_field(&mut self) -> Result<Option<(u32, WireType)>, WireError> {
        if self.is_at_end() {
            return Ok(None);
        }
        let key = self.read_varint()?;
        let wire_type = WireType::from_key(key)?;
        let tag = key >> 3;
        if tag == 0 {
            return Err(WireError::BadFormat {
                reason: "field tag 0".to_string(),
            });
        }
        let tag = u32::try_from(tag).map_err(|_| WireError::Range)?;
        Ok(Some((tag, wire_type)))
    }

    /// Reads a base-128 varint.
    ///
    /// # Errors
    ///
    /// [`WireError::Underrun`] if the stream ends mid-varint,
    /// [`WireError::Range`] if the encoding exceeds 10 bytes or 64 bits.
    pub fn read_varint(&mut self) -> Result<u64, WireError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self.buf.get(self.pos).ok_or(WireError::Underrun)?;
            self.pos += 1;
            let bits = u64::from(byte & 0x7F);
            if shift == 63 && bits > 1 {
                return Err(WireError::Range);
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(WireError::Range)
    }

    /// Reads a varint that must fit in a `u32`.
    ///
    /// # Errors
    ///
    /// As [`Self::read_varint`], plus [`WireError::Range`] on overflow.
    pub fn read_varint_u32(&mut self) -> Result<u32, WireError> {
        u32::try_from(self.read_varint()?).map_err(|_| WireError::Range)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(WireError::Underrun);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Reads a little-endian fixed 8-byte value.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Underrun`] if fewer than 8 bytes remain.
    pub fn read_fixed64(&mut self) -> Result<u64, WireError> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap_or_default()))
    }

    /// Reads a little-endian fixed 4-byte value.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Underrun`] if fewer than 4 bytes remain.
    pub fn read_fixed32(&mut self) -> Result<u32, WireError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap_or_default()))
    }

    /// Reads a length-prefixed byte string.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Overrun`] if the declared length exceeds the
    /// remaining stream.
    pub fn read_length_delimited(&mut self) -> Result<&'a [u8], WireError> {
        let declared = self.read_varint()?;
        let len = usize::try_from(declared).map_err(|_| WireError::Range)?;
        if len > self.remaining() {
            return Err(WireError::Overrun {
                declared,
                remaining: self.remaining(),
            });
        }
        self.take(len)
    }

    /// Reads a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// As [`Self::read_length_delimited`], plus [`WireError::BadFormat`]
    /// on invalid UTF-8.
    pub fn read_string(&mut self) -> Result<&'a str, WireError> {
        let bytes = self.read_length_delimited()?;
        std::str::from_utf8(bytes).map_err(|e| WireError::BadFormat {
            reason: format!("invalid utf-8 in string field: {e}"),
        })
    }

    /// Skips over the payload of a field with the given wire type.
    ///
    /// # Errors
    ///
    /// Propagates the framing errors of the skipped primitive.
    pub fn skip(&mut self, wire_type: WireType) -> Result<(), WireError> {
        match wire_type {
            WireType::Varint => self.read_varint().map(|_| ()),
            WireType::Fixed64 => self.take(8).map(|_| ()),
            WireType::Fixed32 => self.take(4).map(|_| ()),
            WireType::LengthDelimited => self.read_length_delimited().map(|_| ()),
        }
    }
}

/// Append-only field writer, the encoding dual of [`StreamReader`].
#[derive(Debug, Default)]
pub struct StreamWriter {
    buf: Vec<u8>,
}

impl StreamWriter {
    /// Creates an empty writer.
    #[must_use]
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Consumes the writer, returning the encoded bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Appends raw bytes with no framing.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn write_varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    fn write_key(&mut self, tag: u32, wire_type: u64) {
        self.write_varint((u64::from(tag) << 3) | wire_type);
    }

    /// Appends a varint field.
    pub fn write_varint_field(&mut self, tag: u32, value: u64) {
        self.write_key(tag, 0);
        self.write_varint(value);
    }

    /// Appends a fixed 8-byte field.
    pub fn write_fixed64_field(&mut self, tag: u32, value: u64) {
        self.write_key(tag, 1);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a length-prefixed bytes field.
    pub fn write_bytes_field(&mut self, tag: u32, bytes: &[u8]) {
        self.write_key(tag, 2);
        self.write_varint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Appends a length-prefixed string field.
    pub fn write_string_field(&mut self, tag: u32, value: &str) {
        self.write_bytes_field(tag, value.as_bytes());
    }
}

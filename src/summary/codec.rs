//! Primitive encoding for summary files.
//!
//! Writers go through any [`std::io::Write`]; readers use a [`Decoder`]
//! cursor over a byte slice (normally a memory map). All integers are
//! big-endian. A decode never reads past the end of its slice: it fails with
//! [`DecodeError::Truncated`] and leaves the cursor where it was.
//!
//! ```text
//! u32     4 bytes, big-endian
//! time    8 bytes, big-endian signed seconds since the epoch
//! string  u32 n; n == 0 -> absent, otherwise n - 1 bytes followed by NUL
//! token   u32 n; n == 0 -> absent, 1..=N -> token table, n >= 32 -> n - 32 raw bytes
//! ```

use std::borrow::Cow;
use std::io::{self, Write};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use thiserror::Error;

use super::tokens;

/// Encoded width of a timestamp.
pub const TIME_SIZE: usize = 8;

/// Why a decode failed. Every variant means the data cannot be trusted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes remain than the field needs.
    #[error("premature end of data at offset {offset}: needed {needed} byte(s), {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A token id between the table size and the raw-string base.
    #[error("invalid string token {token} at offset {offset}")]
    InvalidToken { token: u32, offset: usize },

    /// A declared element count is larger than the sanity limit or than the
    /// remaining data could possibly hold.
    #[error("{what} count {count} at offset {offset} exceeds limit {limit}")]
    CountTooLarge {
        what: &'static str,
        count: u32,
        limit: usize,
        offset: usize,
    },

    /// A content tree nests deeper than we are willing to recurse.
    #[error("content tree nested deeper than {0} levels")]
    TooDeep(usize),

    /// The header carries a version this build cannot read.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),
}

/// Write a `u32` in network byte order.
pub fn encode_u32<W: Write + ?Sized>(w: &mut W, value: u32) -> io::Result<()> {
    w.write_u32::<BigEndian>(value)
}

/// Write a `u64` in network byte order.
pub fn encode_u64<W: Write + ?Sized>(w: &mut W, value: u64) -> io::Result<()> {
    w.write_u64::<BigEndian>(value)
}

/// Write a timestamp (seconds since the epoch).
pub fn encode_time<W: Write + ?Sized>(w: &mut W, value: i64) -> io::Result<()> {
    w.write_i64::<BigEndian>(value)
}

/// Write a length-prefixed string. `None` and `Some("")` are distinct.
pub fn encode_string<W: Write + ?Sized>(w: &mut W, value: Option<&str>) -> io::Result<()> {
    match value {
        None => encode_u32(w, 0),
        Some(s) => {
            let len = u32::try_from(s.len() + 1).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "string too long for summary")
            })?;
            encode_u32(w, len)?;
            w.write_all(s.as_bytes())?;
            w.write_all(&[0])
        }
    }
}

/// Bounds-checked read cursor over an encoded buffer.
///
/// Strings come back as slices of the underlying buffer, so they cannot
/// outlive the mapping they were decoded from.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Start decoding at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current offset from the start of the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left before the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// `true` once every byte has been consumed.
    pub fn is_at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.remaining();
        if needed > available {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed,
                available,
            });
        }
        let bytes = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(bytes)
    }

    /// Read a big-endian `u32`.
    pub fn decode_u32(&mut self) -> Result<u32, DecodeError> {
        self.take(4).map(BigEndian::read_u32)
    }

    /// Read a big-endian `u64`.
    pub fn decode_u64(&mut self) -> Result<u64, DecodeError> {
        self.take(8).map(BigEndian::read_u64)
    }

    /// Read a timestamp.
    pub fn decode_time(&mut self) -> Result<i64, DecodeError> {
        self.take(TIME_SIZE).map(BigEndian::read_i64)
    }

    /// Read a length-prefixed string as raw bytes borrowed from the buffer.
    pub fn decode_string(&mut self) -> Result<Option<&'a [u8]>, DecodeError> {
        let start = self.pos;
        let len = self.decode_u32()? as usize;
        if len == 0 {
            return Ok(None);
        }
        match self.take(len) {
            Ok(bytes) => Ok(Some(bytes.strip_suffix(&[0]).unwrap_or(bytes))),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    /// Read a length-prefixed string, replacing invalid UTF-8.
    pub fn decode_str(&mut self) -> Result<Option<Cow<'a, str>>, DecodeError> {
        Ok(self.decode_string()?.map(String::from_utf8_lossy))
    }

    /// Read a token-compressed string.
    ///
    /// Table words are returned as `&'static str`, raw strings borrow from
    /// the buffer.
    pub fn decode_token(&mut self) -> Result<Option<Cow<'a, str>>, DecodeError> {
        let start = self.pos;
        let id = self.decode_u32()?;
        if id == 0 {
            return Ok(None);
        }
        if let Some(word) = tokens::token_word(id) {
            return Ok(Some(Cow::Borrowed(word)));
        }
        if id < tokens::RAW_TOKEN_BASE {
            self.pos = start;
            return Err(DecodeError::InvalidToken {
                token: id,
                offset: start,
            });
        }
        match self.take((id - tokens::RAW_TOKEN_BASE) as usize) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(bytes))),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    /// Read an element count and check it against `limit` and against what
    /// the remaining bytes could hold when every element takes at least
    /// `min_item_size` bytes.
    pub fn decode_count(
        &mut self,
        what: &'static str,
        limit: usize,
        min_item_size: usize,
    ) -> Result<usize, DecodeError> {
        let start = self.pos;
        let count = self.decode_u32()?;
        let bound = limit.min(self.remaining() / min_item_size.max(1));
        if count as usize > bound {
            self.pos = start;
            return Err(DecodeError::CountTooLarge {
                what,
                count,
                limit: bound,
                offset: start,
            });
        }
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u32_is_big_endian() {
        let mut buf = Vec::new();
        encode_u32(&mut buf, 0x0102_0304).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(Decoder::new(&buf).decode_u32().unwrap(), 0x0102_0304);
    }

    #[test]
    fn test_short_u32_fails_without_advancing() {
        let buf = [0u8, 1, 2];
        let mut dec = Decoder::new(&buf);
        let err = dec.decode_u32().unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                offset: 0,
                needed: 4,
                available: 3
            }
        );
        assert_eq!(dec.position(), 0);
    }

    #[test]
    fn test_null_and_empty_strings_differ() {
        let mut buf = Vec::new();
        encode_string(&mut buf, None).unwrap();
        encode_string(&mut buf, Some("")).unwrap();
        assert_eq!(buf, [0, 0, 0, 0, 0, 0, 0, 1, 0]);

        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.decode_string().unwrap(), None);
        assert_eq!(dec.decode_string().unwrap(), Some(&b""[..]));
        assert!(dec.is_at_end());
    }

    #[test]
    fn test_string_is_borrowed_from_buffer() {
        let mut buf = Vec::new();
        encode_string(&mut buf, Some("hello")).unwrap();
        let mut dec = Decoder::new(&buf);
        let s = dec.decode_string().unwrap().unwrap();
        assert_eq!(s, b"hello");
        assert_eq!(s.as_ptr(), buf[4..].as_ptr());
    }

    #[test]
    fn test_truncated_string_restores_cursor() {
        let mut buf = Vec::new();
        encode_string(&mut buf, Some("hello")).unwrap();
        buf.truncate(7);
        let mut dec = Decoder::new(&buf);
        assert!(matches!(
            dec.decode_string(),
            Err(DecodeError::Truncated { .. })
        ));
        assert_eq!(dec.position(), 0);
    }

    #[test]
    fn test_time_roundtrip_negative() {
        let mut buf = Vec::new();
        encode_time(&mut buf, -86_400).unwrap();
        assert_eq!(buf.len(), TIME_SIZE);
        assert_eq!(Decoder::new(&buf).decode_time().unwrap(), -86_400);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let buf = [0u8, 0, 0, 3, 0xff, b'a', 0];
        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.decode_str().unwrap().unwrap(), "\u{fffd}a");
    }

    #[test]
    fn test_count_bounded_by_remaining_bytes() {
        let mut buf = Vec::new();
        encode_u32(&mut buf, 3).unwrap();
        buf.extend_from_slice(&[0; 8]);
        let mut dec = Decoder::new(&buf);
        let err = dec.decode_count("reference", 500, 8).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::CountTooLarge {
                count: 3,
                limit: 1,
                ..
            }
        ));
        assert_eq!(dec.position(), 0);
    }

    #[test]
    fn test_count_bounded_by_limit() {
        let mut buf = Vec::new();
        encode_u32(&mut buf, 501).unwrap();
        buf.extend_from_slice(&vec![0; 501 * 4]);
        let mut dec = Decoder::new(&buf);
        assert!(dec.decode_count("child", 500, 4).is_err());
    }
}

//! Summary file layout.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ HEADER                                   │
//! │  version: u32          (15)              │
//! │  flags: u32            (bit 0: content)  │
//! │  next_uid: u32                           │
//! │  last_save: time                         │
//! │  saved_count: u32                        │
//! │  [unread, deleted, junk: u32]  (v13-14)  │
//! │  backend header extension                │
//! ├──────────────────────────────────────────┤
//! │ RECORDS (saved_count times)              │
//! │  see `summary::record`                   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Versions 12 to 14 are read and upgraded on the next save; files are
//! always written as the current version.

use std::io::{self, Write};

use super::codec::{encode_time, encode_u32, DecodeError, Decoder};

/// Version written by this build.
pub const CURRENT_VERSION: u32 = 15;

/// Oldest version that can still be read.
pub const OLDEST_VERSION: u32 = 12;

/// Header flag: every record is followed by its content tree.
pub const FLAG_CONTENT: u32 = 1 << 0;

/// Message counters stored by versions 13 and 14. They are recomputed from
/// the records nowadays and only kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LegacyCounts {
    pub unread: u32,
    pub deleted: u32,
    pub junk: u32,
}

/// Decoded summary header (without the backend extension).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryHeader {
    pub version: u32,
    pub flags: u32,
    pub next_uid: u32,
    /// Seconds since the epoch of the last successful save.
    pub last_save: i64,
    /// Number of records that follow the header.
    pub saved_count: u32,
    pub legacy_counts: Option<LegacyCounts>,
}

impl Default for SummaryHeader {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            flags: 0,
            next_uid: 1,
            last_save: 0,
            saved_count: 0,
            legacy_counts: None,
        }
    }
}

impl SummaryHeader {
    /// `true` when records carry content trees.
    pub fn has_content(&self) -> bool {
        self.flags & FLAG_CONTENT != 0
    }

    /// `true` for a version older than [`CURRENT_VERSION`].
    pub fn is_legacy(&self) -> bool {
        self.version < CURRENT_VERSION
    }

    pub fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        encode_u32(w, self.version)?;
        encode_u32(w, self.flags)?;
        encode_u32(w, self.next_uid)?;
        encode_time(w, self.last_save)?;
        encode_u32(w, self.saved_count)?;
        if carries_counts(self.version) {
            let counts = self.legacy_counts.unwrap_or_default();
            encode_u32(w, counts.unread)?;
            encode_u32(w, counts.deleted)?;
            encode_u32(w, counts.junk)?;
        }
        Ok(())
    }

    /// Decode and version-check a header. The cursor is left at the backend
    /// extension.
    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = dec.decode_u32()?;
        if !(OLDEST_VERSION..=CURRENT_VERSION).contains(&version) {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let flags = dec.decode_u32()?;
        let next_uid = dec.decode_u32()?;
        let last_save = dec.decode_time()?;
        let saved_count = dec.decode_u32()?;
        let legacy_counts = if carries_counts(version) {
            Some(LegacyCounts {
                unread: dec.decode_u32()?,
                deleted: dec.decode_u32()?,
                junk: dec.decode_u32()?,
            })
        } else {
            None
        };
        Ok(Self {
            version,
            flags,
            next_uid,
            last_save,
            saved_count,
            legacy_counts,
        })
    }
}

fn carries_counts(version: u32) -> bool {
    matches!(version, 13 | 14)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_header_roundtrip() {
        let header = SummaryHeader {
            flags: FLAG_CONTENT,
            next_uid: 42,
            last_save: 1_700_000_000,
            saved_count: 41,
            ..SummaryHeader::default()
        };
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 4 * 4 + 8);
        let decoded = SummaryHeader::decode(&mut Decoder::new(&buf)).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.has_content());
        assert!(!decoded.is_legacy());
    }

    #[test]
    fn test_legacy_counts() {
        let header = SummaryHeader {
            version: 14,
            legacy_counts: Some(LegacyCounts {
                unread: 3,
                deleted: 1,
                junk: 0,
            }),
            ..SummaryHeader::default()
        };
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        let decoded = SummaryHeader::decode(&mut Decoder::new(&buf)).unwrap();
        assert_eq!(decoded.legacy_counts.unwrap().unread, 3);
        assert!(decoded.is_legacy());
    }

    #[test]
    fn test_unknown_versions_are_rejected() {
        for version in [0u32, 11, 16, 0x0100_0000] {
            let buf = version.to_be_bytes();
            assert_eq!(
                SummaryHeader::decode(&mut Decoder::new(&buf)),
                Err(DecodeError::UnsupportedVersion(version))
            );
        }
    }
}

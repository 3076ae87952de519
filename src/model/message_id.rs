//! Hashed `Message-ID` values.
//!
//! Summaries do not keep Message-ID strings. They keep the first 64 bits of
//! a SHA-256 digest of the normalised id, which is enough to thread
//! messages and spot duplicates, and is stored as two big-endian halves.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::parser::header::extract_all_angle_brackets;

/// A 64-bit message-id digest. The zero value means "no id".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MessageId {
    pub hi: u32,
    pub lo: u32,
}

impl MessageId {
    /// Build from the two stored halves.
    pub fn from_parts(hi: u32, lo: u32) -> Self {
        Self { hi, lo }
    }

    /// Hash a raw `Message-ID` header value. Returns the zero id for an
    /// empty or whitespace-only value.
    pub fn from_header(raw: &str) -> Self {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            return Self::default();
        }
        let digest = Sha256::digest(normalized.as_bytes());
        Self {
            hi: u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]),
            lo: u32::from_be_bytes([digest[4], digest[5], digest[6], digest[7]]),
        }
    }

    /// `true` for the zero id.
    pub fn is_empty(self) -> bool {
        self.hi == 0 && self.lo == 0
    }

    /// Hash the ids of a `References` header, then `In-Reply-To` if it is
    /// not already the last reference. Oldest ancestor first.
    pub fn references(references: Option<&str>, in_reply_to: Option<&str>) -> Vec<Self> {
        let mut ids: Vec<Self> = references
            .map(extract_all_angle_brackets)
            .unwrap_or_default()
            .iter()
            .map(|r| Self::from_header(r))
            .filter(|id| !id.is_empty())
            .collect();

        if let Some(parent) = in_reply_to
            .and_then(|irt| extract_all_angle_brackets(irt).into_iter().next())
            .map(|irt| Self::from_header(&irt))
            .filter(|id| !id.is_empty())
        {
            if !ids.contains(&parent) {
                ids.push(parent);
            }
        }
        ids
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}{:08x}", self.hi, self.lo)
    }
}

/// Strip angle brackets, comments and whitespace.
fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = match (trimmed.find('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if end > start => &trimmed[start + 1..end],
        _ => trimmed,
    };
    let mut out = String::with_capacity(inner.len());
    let mut depth = 0usize;
    for ch in inner.chars() {
        match ch {
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth > 0 => {}
            c if c.is_whitespace() => {}
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brackets_and_whitespace_are_ignored() {
        let a = MessageId::from_header("<msg001@example.com>");
        let b = MessageId::from_header("  msg001@example.com ");
        let c = MessageId::from_header("(comment) <msg001@example.com>");
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_different_ids_differ() {
        assert_ne!(
            MessageId::from_header("<a@example.com>"),
            MessageId::from_header("<b@example.com>")
        );
    }

    #[test]
    fn test_empty_header_is_zero() {
        assert!(MessageId::from_header("").is_empty());
        assert!(MessageId::from_header(" <> ").is_empty());
    }

    #[test]
    fn test_references_append_in_reply_to() {
        let refs = MessageId::references(
            Some("<a@x.com> <b@x.com>"),
            Some("<c@x.com>"),
        );
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[2], MessageId::from_header("<c@x.com>"));

        let refs = MessageId::references(Some("<a@x.com> <b@x.com>"), Some("<b@x.com>"));
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn test_display_is_hex() {
        let id = MessageId::from_parts(0xdead_beef, 1);
        assert_eq!(id.to_string(), "deadbeef00000001");
    }
}

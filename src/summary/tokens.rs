//! Token table for common MIME words.
//!
//! Content trees repeat the same handful of words ("text", "plain",
//! "us-ascii", "quoted-printable", ...) in every record. Those are stored
//! as a small integer instead of a string.
//!
//! The table is part of the file format: adding, removing or reordering a
//! word changes what existing files decode to and requires a new version.

use std::io::{self, Write};

use super::codec::encode_u32;

/// Sorted table of tokenised words. Ids are `index + 1`.
pub const TOKENS: [&str; 25] = [
    "7bit",
    "8bit",
    "alternative",
    "application",
    "base64",
    "boundary",
    "charset",
    "filename",
    "html",
    "image",
    "iso-8859-1",
    "iso-8859-8",
    "message",
    "mixed",
    "multipart",
    "name",
    "octet-stream",
    "parallel",
    "plain",
    "postscript",
    "quoted-printable",
    "related",
    "rfc822",
    "text",
    "us-ascii",
];

/// Token ids at or above this value encode a raw string of `id - 32` bytes.
pub const RAW_TOKEN_BASE: u32 = 32;

/// Words longer than this are never looked up.
const MAX_TOKEN_LEN: usize = 16;

/// Look up the token id for `word`, case-insensitively.
///
/// Returns `None` when the word is not in the table and must be written
/// as a raw string.
pub fn encode_token(word: &str) -> Option<u32> {
    if word.len() > MAX_TOKEN_LEN {
        return None;
    }
    let lower = word.to_ascii_lowercase();
    TOKENS
        .binary_search(&lower.as_str())
        .ok()
        .map(|idx| idx as u32 + 1)
}

/// Resolve a table id to its word. Ids outside `1..=N` return `None`.
pub fn token_word(id: u32) -> Option<&'static str> {
    let idx = usize::try_from(id).ok()?.checked_sub(1)?;
    TOKENS.get(idx).copied()
}

/// Write `value` as a token: a table id when possible, a raw string otherwise.
pub fn write_token<W: Write + ?Sized>(w: &mut W, value: Option<&str>) -> io::Result<()> {
    let Some(s) = value else {
        return encode_u32(w, 0);
    };
    if let Some(id) = encode_token(s) {
        return encode_u32(w, id);
    }
    let len = u32::try_from(s.len())
        .ok()
        .and_then(|len| len.checked_add(RAW_TOKEN_BASE))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "token too long"))?;
    encode_u32(w, len)?;
    w.write_all(s.as_bytes())
}

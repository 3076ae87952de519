//! RFC 5322 header blocks: unfolding, charset and encoded-word (RFC 2047)
//! decoding, date parsing, and the small header heuristics the summary uses.

use std::borrow::Cow;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

/// An unfolded header block with raw (undecoded) values.
///
/// Names are lower-cased; values keep their original bytes so they can be
/// decoded with whatever charset the message declares.
#[derive(Debug, Clone, Default)]
pub struct RawHeaders {
    fields: Vec<(String, Vec<u8>)>,
}

impl RawHeaders {
    /// Parse a header block. Parsing stops at the first blank line, so the
    /// whole message may be passed in.
    pub fn parse(raw: &[u8]) -> Self {
        let raw = raw.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(raw);
        let mut fields: Vec<(String, Vec<u8>)> = Vec::new();

        for line in raw.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                break;
            }
            if line[0] == b' ' || line[0] == b'\t' {
                if let Some((_, value)) = fields.last_mut() {
                    value.push(b' ');
                    value.extend_from_slice(line.trim_ascii());
                }
                continue;
            }
            if let Some(colon) = line.iter().position(|&b| b == b':') {
                let name = String::from_utf8_lossy(&line[..colon])
                    .trim()
                    .to_ascii_lowercase();
                if !name.is_empty() && !name.contains(char::is_whitespace) {
                    fields.push((name, line[colon + 1..].trim_ascii().to_vec()));
                }
            }
            // Lines without a valid field name (mbox "From " separators) are skipped.
        }

        Self { fields }
    }

    /// Build from already-split `(name, value)` pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            fields: pairs
                .into_iter()
                .map(|(n, v)| (n.trim().to_ascii_lowercase(), v.trim().as_bytes().to_vec()))
                .collect(),
        }
    }

    /// Number of header fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// `true` if the block has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// First raw value for `name` (case-insensitive).
    pub fn raw(&self, name: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// All raw values for `name`, in header order.
    pub fn raw_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// First value for `name` as text, without encoded-word decoding.
    pub fn get(&self, name: &str) -> Option<Cow<'_, str>> {
        self.raw(name).map(|v| decode_raw(v, None))
    }

    /// First value for `name`, decoded for display: raw 8-bit bytes use
    /// `charset` (falling back to UTF-8 / Windows-1252), then RFC 2047
    /// encoded words are resolved.
    pub fn get_decoded(&self, name: &str, charset: Option<&str>) -> Option<String> {
        self.raw(name)
            .map(|v| decode_encoded_words(&decode_raw(v, charset)))
    }

    /// Iterate `(name, value)` pairs as text.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Cow<'_, str>)> {
        self.fields
            .iter()
            .map(|(n, v)| (n.as_str(), decode_raw(v, None)))
    }
}

/// Byte offset of the blank line that ends the header block, if any.
pub fn header_end(data: &[u8]) -> Option<usize> {
    (0..data.len()).find(|&i| {
        data[i..].starts_with(b"\n\n") || data[i..].starts_with(b"\r\n\r\n")
    })
}

/// Byte offset where the body starts (just past the blank line).
pub fn body_start(data: &[u8]) -> usize {
    match header_end(data) {
        Some(i) if data[i] == b'\r' => i + 4,
        Some(i) => i + 2,
        None => data.len(),
    }
}

/// Decode raw header bytes: UTF-8 when valid, otherwise the declared
/// charset, otherwise Windows-1252 (which accepts every byte).
fn decode_raw<'a>(bytes: &'a [u8], charset: Option<&str>) -> Cow<'a, str> {
    if let Ok(s) = std::str::from_utf8(bytes) {
        return Cow::Borrowed(s);
    }
    let encoding = charset
        .and_then(|c| encoding_rs::Encoding::for_label(c.as_bytes()))
        .unwrap_or(encoding_rs::WINDOWS_1252);
    let (decoded, _, _) = encoding.decode(bytes);
    Cow::Owned(decoded.into_owned())
}

/// Decode RFC 2047 encoded-words in a header value.
///
/// Example: `"=?UTF-8?B?SG9sYQ==?= =?UTF-8?B?IG11bmRv?="` -> `"Hola mundo"`
///
/// Words that fail to decode are kept verbatim.
pub fn decode_encoded_words(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut remaining = input;
    let mut last_was_encoded = false;

    while let Some(start) = remaining.find("=?") {
        let before = &remaining[..start];
        // Whitespace between two encoded words is dropped (RFC 2047 §6.2).
        if !last_was_encoded || !before.trim().is_empty() {
            result.push_str(before);
        }
        let after_start = &remaining[start + 2..];
        match decode_one_word(after_start) {
            Some((text, consumed)) => {
                result.push_str(&text);
                remaining = &after_start[consumed..];
                last_was_encoded = true;
            }
            None => {
                result.push_str("=?");
                remaining = after_start;
                last_was_encoded = false;
            }
        }
    }

    result.push_str(remaining);
    result
}

/// Decode `charset?enc?text?=`, returning the text and the bytes consumed.
fn decode_one_word(s: &str) -> Option<(String, usize)> {
    let mut pieces = s.splitn(3, '?');
    let charset = pieces.next()?;
    let encoding = pieces.next()?;
    let rest = pieces.next()?;
    let end = rest.find("?=")?;
    let encoded = &rest[..end];
    let consumed = charset.len() + 1 + encoding.len() + 1 + end + 2;

    // RFC 2231 language suffix: "utf-8*en"
    let charset = charset.split('*').next().unwrap_or(charset);
    let bytes = match encoding {
        "B" | "b" => decode_base64(encoded)?,
        "Q" | "q" => decode_q(encoded),
        _ => return None,
    };
    Some((decode_charset(charset, &bytes), consumed))
}

pub(crate) fn decode_base64(input: &str) -> Option<Vec<u8>> {
    fn value(c: u8) -> Option<u32> {
        match c {
            b'A'..=b'Z' => Some(u32::from(c - b'A')),
            b'a'..=b'z' => Some(u32::from(c - b'a') + 26),
            b'0'..=b'9' => Some(u32::from(c - b'0') + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }

    let mut out = Vec::with_capacity(input.len() * 3 / 4);
    let mut acc = 0u32;
    let mut bits = 0u32;
    for &c in input.as_bytes() {
        if c == b'=' {
            break;
        }
        if c.is_ascii_whitespace() {
            continue;
        }
        acc = (acc << 6) | value(c)?;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    Some(out)
}

/// Q-encoding (RFC 2047 §4.2): `_` is a space, `=XX` is a byte.
fn decode_q(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => out.push(b' '),
            b'=' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'='),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    out
}

/// Decode bytes using a named charset, falling back to lossy UTF-8.
fn decode_charset(charset: &str, bytes: &[u8]) -> String {
    match encoding_rs::Encoding::for_label(charset.trim().as_bytes()) {
        Some(encoding) => encoding.decode(bytes).0.into_owned(),
        None => {
            warn!(charset = charset, "Unknown charset, falling back to UTF-8 lossy");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Extract the first `<...>` token, or the trimmed input if there is none.
pub fn extract_angle_bracket(s: &str) -> String {
    let trimmed = s.trim();
    if let Some(start) = trimmed.find('<') {
        if let Some(end) = trimmed[start..].find('>') {
            return trimmed[start..start + end + 1].to_string();
        }
    }
    trimmed.to_string()
}

/// Extract every `<...>` token (References, In-Reply-To).
pub fn extract_all_angle_brackets(s: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut remaining = s;
    while let Some(start) = remaining.find('<') {
        let Some(end) = remaining[start..].find('>') else {
            break;
        };
        result.push(remaining[start..start + end + 1].to_string());
        remaining = &remaining[start + end + 1..];
    }
    result
}

/// Detect the mailing list a message was delivered through.
///
/// Checks, in order: `List-Id`, `List-Post`, `Mailing-List`,
/// `X-Mailing-List`, `X-BeenThere`, `Delivered-To: mailing list ...`.
pub fn mailing_list(headers: &RawHeaders) -> Option<String> {
    if let Some(id) = headers.get("list-id") {
        let id = extract_angle_bracket(&id);
        let id = id.trim_start_matches('<').trim_end_matches('>');
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }
    if let Some(post) = headers.get("list-post") {
        let post = extract_angle_bracket(&post);
        let post = post.trim_start_matches('<').trim_end_matches('>');
        if let Some(addr) = post.strip_prefix("mailto:") {
            return Some(addr.split('?').next().unwrap_or(addr).to_string());
        }
    }
    if let Some(ml) = headers.get("mailing-list") {
        // "list foo@bar.org; contact foo-owner@bar.org"
        if let Some(rest) = ml.trim().strip_prefix("list ") {
            return Some(rest.split(';').next().unwrap_or(rest).trim().to_string());
        }
    }
    for name in ["x-mailing-list", "x-beenthere"] {
        if let Some(value) = headers.get(name) {
            let value = extract_angle_bracket(&value);
            let value = value.trim_start_matches('<').trim_end_matches('>');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    headers
        .raw_all("delivered-to")
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .find_map(|v| {
            v.trim()
                .strip_prefix("mailing list ")
                .map(|rest| rest.trim().to_string())
        })
}

/// Date of the most recent `Received:` hop (the first header, the part
/// after the last `;`).
pub fn received_date(headers: &RawHeaders) -> Option<DateTime<Utc>> {
    let received = headers.get("received")?;
    let date = received.rsplit(';').next()?;
    parse_date(date)
}

/// Parse an email date string in various common formats.
///
/// Supports RFC 2822, ISO 8601, and many broken real-world variants.
pub fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    let trimmed = date_str.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    let no_dow = strip_day_of_week(trimmed);
    let normalized = normalize_imap_date(&no_dow);

    const FORMATS: [&str; 10] = [
        "%d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M:%S %Z",
        "%d %b %Y %H:%M:%S",
        "%b %d %H:%M:%S %Y",
        "%Y-%m-%dT%H:%M:%S%z",
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y-%m-%d %H:%M:%S %z",
        "%Y-%m-%d %H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
        "%m/%d/%Y %H:%M:%S",
    ];

    let candidates = [
        no_dow.clone(),
        normalized.clone(),
        replace_named_tz(&no_dow),
        replace_named_tz(&normalized),
    ];
    for candidate in &candidates {
        for fmt in &FORMATS {
            if let Ok(dt) = DateTime::parse_from_str(candidate, fmt) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(ndt) = NaiveDateTime::parse_from_str(candidate, fmt) {
                return Some(Utc.from_utc_datetime(&ndt));
            }
        }
    }

    if let Some(dt) = mail_parser_date(trimmed) {
        return Some(dt);
    }

    warn!(date = trimmed, "Could not parse date");
    None
}

/// Let `mail-parser` try, by wrapping the value in a one-line message.
fn mail_parser_date(input: &str) -> Option<DateTime<Utc>> {
    let fake_msg = format!("Date: {input}\n\n");
    let parsed = mail_parser::MessageParser::default().parse(fake_msg.as_bytes())?;
    let dt = parsed.date()?.to_rfc3339();
    DateTime::parse_from_rfc3339(&dt)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// `"16-JUL-2025 03:01:03"` -> `"16 Jul 2025 03:01:03"` (IMAP INTERNALDATE style).
fn normalize_imap_date(s: &str) -> String {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    if !s.contains('-') {
        return s.to_string();
    }
    let lower = s.to_ascii_lowercase();
    for month in MONTHS {
        let pattern = format!("-{}-", month.to_ascii_lowercase());
        if let Some(pos) = lower.find(&pattern) {
            let mut result = s.to_string();
            result.replace_range(pos..pos + pattern.len(), &format!(" {month} "));
            return result;
        }
    }
    s.to_string()
}

/// Strip a leading `"Thu, "` / `"Thu "`.
fn strip_day_of_week(s: &str) -> String {
    const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    for day in DAYS {
        if let Some(rest) = s.strip_prefix(day) {
            if rest.starts_with(',') || rest.starts_with(' ') {
                return rest.trim_start_matches(',').trim().to_string();
            }
        }
    }
    s.to_string()
}

/// Replace a trailing timezone abbreviation with its numeric offset.
fn replace_named_tz(s: &str) -> String {
    const ZONES: [(&str, &str); 13] = [
        ("CEST", "+0200"),
        ("EST", "-0500"),
        ("EDT", "-0400"),
        ("CST", "-0600"),
        ("CDT", "-0500"),
        ("MST", "-0700"),
        ("MDT", "-0600"),
        ("PST", "-0800"),
        ("PDT", "-0700"),
        ("GMT", "+0000"),
        ("UTC", "+0000"),
        ("CET", "+0100"),
        ("JST", "+0900"),
    ];
    for (name, offset) in ZONES {
        if let Some(head) = s.strip_suffix(name) {
            return format!("{head}{offset}");
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unfolds_and_stops_at_body() {
        let raw = b"Subject: This is a long\r\n\tsubject line\r\nFrom: user@example.com\r\n\r\nX-Not: a header\r\n";
        let headers = RawHeaders::parse(raw);
        assert_eq!(headers.len(), 2);
        assert_eq!(
            headers.get("SUBJECT").unwrap(),
            "This is a long subject line"
        );
        assert!(headers.get("x-not").is_none());
    }

    #[test]
    fn test_get_decoded_uses_declared_charset() {
        let mut raw = b"Subject: caf".to_vec();
        raw.push(0xe9);
        raw.extend_from_slice(b"\n\n");
        let headers = RawHeaders::parse(&raw);
        assert_eq!(
            headers.get_decoded("subject", Some("iso-8859-1")).unwrap(),
            "café"
        );
    }

    #[test]
    fn test_decode_base64_encoded_word() {
        assert_eq!(decode_encoded_words("=?UTF-8?B?SG9sYSBtdW5kbw==?="), "Hola mundo");
    }

    #[test]
    fn test_decode_q_encoded_word() {
        assert_eq!(decode_encoded_words("=?ISO-8859-1?Q?caf=E9?="), "café");
        assert_eq!(
            decode_encoded_words("=?ISO-8859-1?Q?R=E9sum=E9_du_projet?="),
            "Résumé du projet"
        );
    }

    #[test]
    fn test_decode_adjacent_encoded_words() {
        assert_eq!(
            decode_encoded_words("=?UTF-8?B?SG9sYQ==?= =?UTF-8?B?IG11bmRv?="),
            "Hola mundo"
        );
        assert_eq!(
            decode_encoded_words("Re: =?UTF-8?B?SG9sYQ==?= there"),
            "Re: Hola there"
        );
    }

    #[test]
    fn test_undecodable_word_is_kept() {
        assert_eq!(decode_encoded_words("=?x?Z?abc?= tail"), "=?x?Z?abc?= tail");
    }

    #[test]
    fn test_header_end() {
        assert_eq!(header_end(b"From: a@b.com\nSubject: Hi\n\nBody\n"), Some(25));
        assert_eq!(
            header_end(b"From: a@b.com\r\nSubject: Hi\r\n\r\nBody\r\n"),
            Some(26)
        );
        assert_eq!(body_start(b"A: b\n\nBody"), 6);
    }

    #[test]
    fn test_mailing_list_detection() {
        let h = RawHeaders::from_pairs([("List-Id", "Rust users <rust-users.lists.example.org>")]);
        assert_eq!(mailing_list(&h).as_deref(), Some("rust-users.lists.example.org"));

        let h = RawHeaders::from_pairs([("List-Post", "<mailto:dev@lists.example.org?subject=x>")]);
        assert_eq!(mailing_list(&h).as_deref(), Some("dev@lists.example.org"));

        let h = RawHeaders::from_pairs([("Delivered-To", "mailing list announce@example.org")]);
        assert_eq!(mailing_list(&h).as_deref(), Some("announce@example.org"));

        assert_eq!(mailing_list(&RawHeaders::default()), None);
    }

    #[test]
    fn test_received_date() {
        let h = RawHeaders::from_pairs([(
            "Received",
            "from mx.example.com by mail.example.org; Thu, 04 Jan 2024 10:00:00 +0000",
        )]);
        let dt = received_date(&h).unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2024-01-04");
    }

    #[test]
    fn test_parse_date_formats() {
        assert!(parse_date("Thu, 04 Jan 2024 10:00:00 +0000").is_some());
        assert!(parse_date("04 Jan 2024 10:00:00 +0000").is_some());
        assert!(parse_date("Thu, 04 Jan 2024 10:00:00 EST").is_some());
        assert!(parse_date("2024-01-04T10:00:00Z").is_some());
        assert!(parse_date("").is_none());
    }

    #[test]
    fn test_parse_date_imap_style() {
        let dt = parse_date("16-JUL-2025 03:01:03").unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2025-07-16");
    }
}

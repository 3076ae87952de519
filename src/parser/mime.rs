//! Pull-based MIME structure parser and body helpers.
//!
//! [`MimeParser`] walks one message held in memory and reports its MIME
//! structure as a sequence of states. Callers pull states with
//! [`MimeParser::step`] and may push the last one back with
//! [`MimeParser::unstep`]; headers and body bytes of the current part are
//! available while it is current.
//!
//! ```text
//! leaf:      Header Body BodyEnd
//! multipart: Multipart <child>* MultipartEnd
//! message:   Message <child> MessageEnd
//! ```
//! The whole message is followed by `Eof`.

use std::borrow::Cow;
use std::ops::Range;

use tracing::{trace, warn};

use crate::model::content_info::ContentType;

use super::header::{self, RawHeaders};

/// Maximum multipart/message nesting (to prevent unbounded recursion on
/// adversarial input). Deeper containers are reported as leaves.
pub const MAX_DEPTH: usize = 10;

/// Parser position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeState {
    /// Nothing has been read yet.
    Initial,
    /// Headers of a leaf part.
    Header,
    /// Body bytes of the current leaf part.
    Body,
    /// End of a leaf part.
    BodyEnd,
    /// Headers of a multipart container.
    Multipart,
    /// End of a multipart container.
    MultipartEnd,
    /// Headers of a `message/rfc822` part.
    Message,
    /// End of a `message/rfc822` part.
    MessageEnd,
    /// End of input.
    Eof,
}

#[derive(Debug)]
struct Part {
    headers: RawHeaders,
    content_type: ContentType,
    body: Range<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Event {
    state: MimeState,
    part: Option<usize>,
}

/// Pull parser over one in-memory message.
#[derive(Debug)]
pub struct MimeParser<'a> {
    data: &'a [u8],
    parts: Vec<Part>,
    events: Vec<Event>,
    /// Index of the next event `step` returns.
    cursor: usize,
}

impl<'a> MimeParser<'a> {
    /// Prepare a parser for `data`, a complete message (headers and body).
    /// A leading mbox `From ` line is skipped.
    pub fn new(data: &'a [u8]) -> Self {
        let data = skip_from_line(data);
        let mut parser = Self {
            data,
            parts: Vec::new(),
            events: Vec::new(),
            cursor: 0,
        };
        parser.scan(0, data.len(), 0);
        parser.events.push(Event {
            state: MimeState::Eof,
            part: None,
        });
        trace!(parts = parser.parts.len(), "Scanned MIME structure");
        parser
    }

    /// Advance to the next state and return it. Stays at `Eof`.
    pub fn step(&mut self) -> MimeState {
        let state = self
            .events
            .get(self.cursor)
            .map(|e| e.state)
            .unwrap_or(MimeState::Eof);
        self.cursor = (self.cursor + 1).min(self.events.len());
        state
    }

    /// Push the last state back so the next `step` returns it again.
    pub fn unstep(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    /// The state returned by the last `step`.
    pub fn state(&self) -> MimeState {
        self.current().map(|e| e.state).unwrap_or(MimeState::Initial)
    }

    /// The whole message.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Headers of the current part (`None` before the first step and at `Eof`).
    pub fn headers(&self) -> Option<&RawHeaders> {
        self.current_part().map(|p| &p.headers)
    }

    /// Content type of the current part.
    pub fn content_type(&self) -> Option<&ContentType> {
        self.current_part().map(|p| &p.content_type)
    }

    /// Raw (still transfer-encoded) body of the current part. For
    /// containers this is everything after their header block.
    pub fn body(&self) -> &'a [u8] {
        let data = self.data;
        self.current_part()
            .and_then(|p| data.get(p.body.clone()))
            .unwrap_or_default()
    }

    fn current(&self) -> Option<&Event> {
        self.cursor.checked_sub(1).and_then(|i| self.events.get(i))
    }

    fn current_part(&self) -> Option<&Part> {
        self.current()
            .and_then(|e| e.part)
            .and_then(|i| self.parts.get(i))
    }

    /// Record events for the entity in `data[start..end]`.
    fn scan(&mut self, start: usize, end: usize, depth: usize) {
        let data = self.data;
        let entity = &data[start..end];
        let body_offset = if entity.starts_with(b"\r\n") {
            2
        } else if entity.starts_with(b"\n") {
            1
        } else {
            header::body_start(entity)
        };
        let headers = RawHeaders::parse(&entity[..body_offset]);
        let content_type = headers
            .get("content-type")
            .map(|v| ContentType::parse(&v))
            .unwrap_or_default();
        let body = start + body_offset..end;

        let boundary = content_type
            .is("multipart", "*")
            .then(|| content_type.param("boundary").map(str::to_string))
            .flatten();
        let is_message = content_type.is("message", "rfc822");

        if depth >= MAX_DEPTH && (boundary.is_some() || is_message) {
            warn!(depth, "MIME nesting too deep, treating part as opaque");
        }

        let part = self.parts.len();
        self.parts.push(Part {
            headers,
            content_type,
            body: body.clone(),
        });

        match boundary {
            Some(boundary) if depth < MAX_DEPTH => {
                self.push(MimeState::Multipart, part);
                for (s, e) in split_multipart(self.data, body.clone(), &boundary) {
                    self.scan(s, e, depth + 1);
                }
                self.push(MimeState::MultipartEnd, part);
            }
            _ if is_message && depth < MAX_DEPTH => {
                self.push(MimeState::Message, part);
                self.scan(body.start, body.end, depth + 1);
                self.push(MimeState::MessageEnd, part);
            }
            _ => {
                self.push(MimeState::Header, part);
                self.push(MimeState::Body, part);
                self.push(MimeState::BodyEnd, part);
            }
        }
    }

    fn push(&mut self, state: MimeState, part: usize) {
        self.events.push(Event {
            state,
            part: Some(part),
        });
    }
}

/// Byte ranges of the parts of a multipart body. The preamble and epilogue
/// are dropped; the line break before each delimiter belongs to it. A body
/// without a closing delimiter ends its last part at `body.end`.
fn split_multipart(data: &[u8], body: Range<usize>, boundary: &str) -> Vec<(usize, usize)> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let mut parts = Vec::new();
    let mut current: Option<usize> = None;
    let mut pos = body.start;

    while pos < body.end {
        let line_end = data[pos..body.end]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| pos + i + 1)
            .unwrap_or(body.end);
        let line = &data[pos..line_end];

        if let Some(rest) = line.strip_prefix(delimiter) {
            let closing = rest.starts_with(b"--");
            if closing || rest.trim_ascii().is_empty() {
                if let Some(s) = current.take() {
                    parts.push((s, trim_line_break(data, s, pos)));
                }
                if closing {
                    return parts;
                }
                current = Some(line_end);
            }
        }
        pos = line_end;
    }

    if let Some(s) = current {
        warn!(boundary, "Multipart body has no closing delimiter");
        parts.push((s, body.end));
    }
    parts
}

/// End of a part whose delimiter line starts at `end`.
fn trim_line_break(data: &[u8], start: usize, end: usize) -> usize {
    let mut e = end;
    if e > start && data[e - 1] == b'\n' {
        e -= 1;
        if e > start && data[e - 1] == b'\r' {
            e -= 1;
        }
    }
    e
}

/// Skip the `From ` separator line at the start of MBOX messages.
pub fn skip_from_line(data: &[u8]) -> &[u8] {
    let data = data.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(data);
    if data.starts_with(b"From ") {
        if let Some(pos) = data.iter().position(|&b| b == b'\n') {
            return &data[pos + 1..];
        }
    }
    data
}

/// Undo a `Content-Transfer-Encoding`. Unknown encodings pass through.
pub fn decode_transfer<'b>(encoding: Option<&str>, body: &'b [u8]) -> Cow<'b, [u8]> {
    match encoding.map(str::trim) {
        Some(e) if e.eq_ignore_ascii_case("base64") => {
            match header::decode_base64(&String::from_utf8_lossy(body)) {
                Some(decoded) => Cow::Owned(decoded),
                None => {
                    warn!("Invalid base64 body, using raw bytes");
                    Cow::Borrowed(body)
                }
            }
        }
        Some(e) if e.eq_ignore_ascii_case("quoted-printable") => {
            Cow::Owned(decode_quoted_printable(body))
        }
        _ => Cow::Borrowed(body),
    }
}

/// Quoted-printable (RFC 2045 §6.7): `=XX` escapes and soft line breaks.
pub fn decode_quoted_printable(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'=' {
            match input.get(i + 1..).unwrap_or_default() {
                [b'\r', b'\n', ..] => {
                    i += 3;
                    continue;
                }
                [b'\n', ..] => {
                    i += 2;
                    continue;
                }
                [h, l, ..] => {
                    if let (Some(h), Some(l)) = (hex_value(*h), hex_value(*l)) {
                        out.push((h << 4) | l);
                        i += 3;
                        continue;
                    }
                }
                _ => {}
            }
        }
        out.push(input[i]);
        i += 1;
    }
    out
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Decode body bytes to text with `charset`, falling back to UTF-8 then
/// Windows-1252.
pub fn decode_text<'b>(bytes: &'b [u8], charset: Option<&str>) -> Cow<'b, str> {
    if let Some(encoding) = charset.and_then(|c| encoding_rs::Encoding::for_label(c.trim().as_bytes())) {
        return encoding.decode(bytes).0;
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => Cow::Borrowed(s),
        Err(_) => encoding_rs::WINDOWS_1252.decode(bytes).0,
    }
}

/// Convert HTML to plain text for indexing and display.
///
/// - Preserves line breaks from `<br>`, `<p>`, `<div>`
/// - Converts `<li>` to a new line
/// - Removes scripts and styles
/// - Decodes common HTML entities
pub fn html_to_text(html: &str, _width: usize) -> String {
    let mut text = remove_tag_block(html, "script");
    text = remove_tag_block(&text, "style");

    for tag in ["br", "BR", "br/", "br /"] {
        text = text.replace(&format!("<{tag}>"), "\n");
    }
    for tag in ["p", "div", "tr", "li", "h1", "h2", "h3", "h4", "h5", "h6"] {
        let upper = tag.to_uppercase();
        text = text
            .replace(&format!("<{tag}>"), "\n")
            .replace(&format!("<{tag} "), "\n<")
            .replace(&format!("<{upper}>"), "\n")
            .replace(&format!("</{tag}>"), "\n")
            .replace(&format!("</{upper}>"), "\n");
    }

    let mut stripped = String::with_capacity(text.len());
    let mut in_tag = false;
    for ch in text.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => stripped.push(ch),
            _ => {}
        }
    }

    const ENTITIES: [(&str, &str); 8] = [
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&#39;", "'"),
        ("&apos;", "'"),
        ("&nbsp;", " "),
        ("&#160;", " "),
        ("&amp;", "&"),
    ];
    for (entity, replacement) in ENTITIES {
        stripped = stripped.replace(entity, replacement);
    }

    // Collapse runs of blank lines.
    let mut prev_was_blank = false;
    let mut cleaned = String::with_capacity(stripped.len());
    for line in stripped.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !prev_was_blank {
                cleaned.push('\n');
                prev_was_blank = true;
            }
        } else {
            cleaned.push_str(trimmed);
            cleaned.push('\n');
            prev_was_blank = false;
        }
    }

    cleaned.trim().to_string()
}

/// Remove an entire tag block (e.g. `<script>…</script>`).
fn remove_tag_block(html: &str, tag: &str) -> String {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut result = String::with_capacity(html.len());
    let mut remaining = html;

    // ASCII lower-casing keeps byte offsets aligned with `remaining`.
    while let Some(start) = remaining.to_ascii_lowercase().find(&open) {
        result.push_str(&remaining[..start]);
        let after = &remaining[start..];
        match after.to_ascii_lowercase().find(&close) {
            Some(end) => remaining = &after[end + close.len()..],
            None => {
                remaining = "";
                break;
            }
        }
    }
    result.push_str(remaining);
    result
}

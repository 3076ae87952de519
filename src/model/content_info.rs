//! MIME structure of a message, as stored in the summary.
//!
//! A [`ContentInfo`] describes one MIME part; multipart and message/rfc822
//! parts own their children. Trees are built from a header block, from a
//! [`MimeParser`] pass, or from an already-parsed `mail_parser::Message`.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Write};

use mail_parser::{MimeHeaders, PartType};
use tracing::{trace, warn};

use crate::parser::header::{self, RawHeaders};
use crate::parser::mime::{self, MimeParser, MimeState};
use crate::summary::codec::{encode_u32, DecodeError, Decoder};
use crate::summary::indexer::IndexTarget;
use crate::summary::tokens::write_token;

/// Maximum parameters or children accepted for one part when loading.
pub const MAX_PART_ITEMS: usize = 500;

/// Maximum nesting accepted when loading a tree.
pub const MAX_TREE_DEPTH: usize = 64;

/// Smallest possible encoded part: five tokens, three counts/sizes.
const MIN_PART_SIZE: usize = 8 * 4;

/// A parsed `Content-Type` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    /// Lower-cased top-level type (`text`, `multipart`, ...).
    pub media_type: String,
    /// Lower-cased subtype (`plain`, `mixed`, ...).
    pub subtype: String,
    /// Parameters in header order; names lower-cased, values unquoted.
    pub params: Vec<(String, String)>,
}

impl Default for ContentType {
    fn default() -> Self {
        Self::new("text", "plain")
    }
}

impl ContentType {
    pub fn new(media_type: &str, subtype: &str) -> Self {
        Self {
            media_type: media_type.to_ascii_lowercase(),
            subtype: subtype.to_ascii_lowercase(),
            params: Vec::new(),
        }
    }

    /// Parse a header value such as `text/plain; charset="utf-8"`.
    ///
    /// An empty or unusable value yields `text/plain`. A missing subtype is
    /// filled in from the type (`text` -> `plain`, `multipart` -> `mixed`,
    /// anything else -> `octet-stream`).
    pub fn parse(raw: &str) -> Self {
        let mut pieces = split_params(raw).into_iter();
        let mime = pieces.next().unwrap_or_default();
        let mime = mime.trim();
        if mime.is_empty() {
            return Self::default();
        }

        let (media_type, subtype) = match mime.split_once('/') {
            Some((t, s)) if !t.trim().is_empty() => (t.trim(), s.trim()),
            Some(_) => return Self::default(),
            None => (mime, ""),
        };
        let subtype = if subtype.is_empty() {
            default_subtype(media_type)
        } else {
            subtype
        };

        let mut ct = Self::new(media_type, subtype);
        for piece in pieces {
            if let Some((name, value)) = piece.split_once('=') {
                let name = name.trim().to_ascii_lowercase();
                if !name.is_empty() {
                    ct.params.push((name, unquote(value.trim())));
                }
            }
        }
        ct
    }

    /// Case-insensitive match; `"*"` matches any subtype.
    pub fn is(&self, media_type: &str, subtype: &str) -> bool {
        self.media_type.eq_ignore_ascii_case(media_type)
            && (subtype == "*" || self.subtype.eq_ignore_ascii_case(subtype))
    }

    /// Value of parameter `name` (case-insensitive).
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `"type/subtype"`.
    pub fn mime_type(&self) -> String {
        format!("{}/{}", self.media_type, self.subtype)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.media_type, self.subtype)?;
        for (name, value) in &self.params {
            write!(f, "; {name}=\"{value}\"")?;
        }
        Ok(())
    }
}

fn default_subtype(media_type: &str) -> &'static str {
    if media_type.eq_ignore_ascii_case("text") {
        "plain"
    } else if media_type.eq_ignore_ascii_case("multipart") {
        "mixed"
    } else {
        "octet-stream"
    }
}

/// Split on `;` outside double quotes.
fn split_params(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, ch) in raw.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

fn unquote(s: &str) -> String {
    s.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(s)
        .to_string()
}

/// Index path from the root of a content tree to one of its parts.
///
/// The root is the empty path; `[1, 0]` is the first child of the second
/// child. Paths replace parent back-pointers: walking up is `parent()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ContentPath(Vec<usize>);

impl ContentPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Path of the `index`-th child of this part.
    pub fn child(&self, index: usize) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    /// Path of the enclosing part, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        let (_, head) = self.0.split_last()?;
        Some(Self(head.to_vec()))
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }
}

impl fmt::Display for ContentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("0");
        }
        // IMAP-style part numbers start at 1.
        let parts: Vec<String> = self.0.iter().map(|i| (i + 1).to_string()).collect();
        f.write_str(&parts.join("."))
    }
}

/// One MIME part.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentInfo {
    pub content_type: ContentType,
    /// `Content-ID` without angle brackets.
    pub id: Option<String>,
    pub description: Option<String>,
    /// Lower-cased `Content-Transfer-Encoding`.
    pub encoding: Option<String>,
    /// Encoded body size in bytes.
    pub size: u32,
    pub children: Vec<ContentInfo>,
}

impl ContentInfo {
    /// Describe a part from its header block alone. Size and children are
    /// left empty.
    pub fn new_from_header(headers: &RawHeaders) -> Self {
        let content_type = headers
            .get("content-type")
            .map(|v| ContentType::parse(&v))
            .unwrap_or_default();
        let charset = content_type.param("charset").map(str::to_string);

        let id = headers.get("content-id").and_then(|v| {
            let id = header::extract_angle_bracket(&v);
            let id = id.trim_start_matches('<').trim_end_matches('>').trim();
            (!id.is_empty()).then(|| id.to_string())
        });
        let description = headers
            .get_decoded("content-description", charset.as_deref())
            .filter(|d| !d.is_empty());
        let encoding = headers
            .get("content-transfer-encoding")
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty());

        Self {
            content_type,
            id,
            description,
            encoding,
            size: 0,
            children: Vec::new(),
        }
    }

    /// Build the tree for the part at the parser's next state.
    ///
    /// Leaf bodies are fed to `index` when given. Returns `None` when the
    /// parser is at the end of its input.
    pub fn new_from_parser(parser: &mut MimeParser<'_>, index: Option<IndexTarget<'_>>) -> Option<Self> {
        match parser.step() {
            MimeState::Header => {
                let mut info = Self::new_from_header(parser.headers()?);
                let mut size = 0usize;
                loop {
                    match parser.step() {
                        MimeState::Body => {
                            let body = parser.body();
                            size += body.len();
                            if let Some(target) = index {
                                index_body(target, &info, body);
                            }
                        }
                        MimeState::BodyEnd => break,
                        other => {
                            warn!(state = ?other, "Unexpected parser state inside a body");
                            parser.unstep();
                            break;
                        }
                    }
                }
                info.size = clamp_size(size);
                Some(info)
            }
            MimeState::Multipart => {
                let mut info = Self::new_from_header(parser.headers()?);
                info.size = clamp_size(parser.body().len());
                loop {
                    match parser.step() {
                        MimeState::MultipartEnd => break,
                        MimeState::Eof => {
                            warn!("Multipart ended without a closing delimiter");
                            parser.unstep();
                            break;
                        }
                        _ => {
                            parser.unstep();
                            match Self::new_from_parser(parser, index) {
                                Some(child) => info.children.push(child),
                                None => break,
                            }
                        }
                    }
                }
                Some(info)
            }
            MimeState::Message => {
                let mut info = Self::new_from_header(parser.headers()?);
                info.size = clamp_size(parser.body().len());
                if let Some(child) = Self::new_from_parser(parser, index) {
                    info.children.push(child);
                }
                match parser.step() {
                    MimeState::MessageEnd => {}
                    other => {
                        warn!(state = ?other, "Expected the end of an attached message");
                        parser.unstep();
                    }
                }
                Some(info)
            }
            _ => {
                parser.unstep();
                None
            }
        }
    }

    /// Build the tree from a message parsed by `mail-parser`.
    pub fn new_from_message(message: &mail_parser::Message<'_>, index: Option<IndexTarget<'_>>) -> Self {
        Self::from_message_part(message, 0, index, 0)
    }

    fn from_message_part(
        message: &mail_parser::Message<'_>,
        part_id: usize,
        index: Option<IndexTarget<'_>>,
        depth: usize,
    ) -> Self {
        let Some(part) = message.part(part_id) else {
            return Self::default();
        };

        let content_type = part
            .content_type()
            .map(|ct| {
                let mut parsed = ContentType::new(
                    ct.ctype(),
                    ct.subtype().unwrap_or_else(|| default_subtype(ct.ctype())),
                );
                if let Some(attrs) = ct.attributes() {
                    parsed.params = attrs
                        .iter()
                        .map(|(n, v)| (n.to_ascii_lowercase(), v.to_string()))
                        .collect();
                }
                parsed
            })
            .unwrap_or_default();

        let mut info = Self {
            content_type,
            id: part
                .content_id()
                .map(|id| id.trim_start_matches('<').trim_end_matches('>').to_string()),
            description: part.content_description().map(str::to_string),
            encoding: part
                .content_transfer_encoding()
                .map(|e| e.trim().to_ascii_lowercase()),
            size: clamp_size(part.offset_end.saturating_sub(part.offset_body)),
            children: Vec::new(),
        };

        if depth >= mime::MAX_DEPTH {
            return info;
        }

        match &part.body {
            PartType::Multipart(children) => {
                info.children = children
                    .iter()
                    .map(|&child| Self::from_message_part(message, child, index, depth + 1))
                    .collect();
            }
            PartType::Message(nested) => {
                info.children
                    .push(Self::from_message_part(nested, 0, index, depth + 1));
            }
            PartType::Text(text) => {
                if let Some(target) = index {
                    target.indexer.add_text(target.uid, text);
                }
            }
            PartType::Html(html) => {
                if let Some(target) = index {
                    target
                        .indexer
                        .add_text(target.uid, &mime::html_to_text(html, 80));
                }
            }
            PartType::Binary(_) | PartType::InlineBinary(_) => {}
        }
        info
    }

    /// Depth-first, pre-order walk over every part with its path.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            stack: vec![(ContentPath::root(), self)],
        }
    }

    /// The part at `path`, if it exists.
    pub fn at(&self, path: &ContentPath) -> Option<&ContentInfo> {
        path.indices()
            .iter()
            .try_fold(self, |part, &i| part.children.get(i))
    }

    /// `true` if the tree has a `multipart/mixed` or an attached message.
    pub fn has_attachments(&self) -> bool {
        self.walk().any(|(_, part)| {
            part.content_type.is("multipart", "mixed") || part.content_type.is("message", "rfc822")
        })
    }

    /// Number of parts in the tree, including this one.
    pub fn part_count(&self) -> usize {
        self.walk().count()
    }

    /// Serialise a tree. `None` is written as an empty placeholder part.
    pub fn save<W: Write + ?Sized>(info: Option<&ContentInfo>, w: &mut W) -> io::Result<()> {
        let Some(info) = info else {
            for _ in 0..2 {
                write_token(w, None)?;
            }
            encode_u32(w, 0)?;
            for _ in 0..3 {
                write_token(w, None)?;
            }
            encode_u32(w, 0)?;
            return encode_u32(w, 0);
        };

        write_token(w, Some(&info.content_type.media_type))?;
        write_token(w, Some(&info.content_type.subtype))?;
        encode_u32(w, count_u32(info.content_type.params.len())?)?;
        for (name, value) in &info.content_type.params {
            write_token(w, Some(name))?;
            write_token(w, Some(value))?;
        }
        write_token(w, info.id.as_deref())?;
        write_token(w, info.description.as_deref())?;
        write_token(w, info.encoding.as_deref())?;
        encode_u32(w, info.size)?;
        encode_u32(w, count_u32(info.children.len())?)?;
        for child in &info.children {
            Self::save(Some(child), w)?;
        }
        Ok(())
    }

    /// Decode a tree written by [`ContentInfo::save`].
    pub fn load(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Self::load_at(dec, 0)
    }

    fn load_at(dec: &mut Decoder<'_>, depth: usize) -> Result<Self, DecodeError> {
        if depth >= MAX_TREE_DEPTH {
            return Err(DecodeError::TooDeep(MAX_TREE_DEPTH));
        }

        let media_type = dec.decode_token()?;
        let subtype = dec.decode_token()?;
        let mut content_type = match media_type.as_deref() {
            Some(t) if !t.is_empty() => {
                let sub: Cow<'_, str> = match subtype {
                    Some(s) if !s.is_empty() => s,
                    _ => Cow::Borrowed(default_subtype(t)),
                };
                ContentType::new(t, &sub)
            }
            _ => ContentType::default(),
        };

        let param_count = dec.decode_count("content parameter", MAX_PART_ITEMS, 8)?;
        for _ in 0..param_count {
            let name = dec.decode_token()?;
            let value = dec.decode_token()?;
            if let Some(name) = name {
                content_type
                    .params
                    .push((name.into_owned(), value.map(Cow::into_owned).unwrap_or_default()));
            }
        }

        let id = dec.decode_token()?.map(Cow::into_owned);
        let description = dec.decode_token()?.map(Cow::into_owned);
        let encoding = dec.decode_token()?.map(Cow::into_owned);
        let size = dec.decode_u32()?;

        let child_count = dec.decode_count("content child", MAX_PART_ITEMS, MIN_PART_SIZE)?;
        let mut children = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            children.push(Self::load_at(dec, depth + 1)?);
        }

        trace!(mime = %content_type.mime_type(), size, children = children.len(), "Loaded content part");
        Ok(Self {
            content_type,
            id,
            description,
            encoding,
            size,
            children,
        })
    }
}

/// Iterator returned by [`ContentInfo::walk`].
pub struct Walk<'a> {
    stack: Vec<(ContentPath, &'a ContentInfo)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (ContentPath, &'a ContentInfo);

    fn next(&mut self) -> Option<Self::Item> {
        let (path, part) = self.stack.pop()?;
        for (i, child) in part.children.iter().enumerate().rev() {
            self.stack.push((path.child(i), child));
        }
        Some((path, part))
    }
}

/// Decode a leaf body and hand its text to the indexer.
fn index_body(target: IndexTarget<'_>, info: &ContentInfo, body: &[u8]) {
    if !info.content_type.is("text", "*") {
        return;
    }
    let decoded = mime::decode_transfer(info.encoding.as_deref(), body);
    let text = mime::decode_text(&decoded, info.content_type.param("charset"));
    if info.content_type.is("text", "html") {
        target.indexer.add_text(target.uid, &mime::html_to_text(&text, 80));
    } else {
        target.indexer.add_text(target.uid, &text);
    }
}

fn clamp_size(size: usize) -> u32 {
    u32::try_from(size).unwrap_or(u32::MAX)
}

fn count_u32(n: usize) -> io::Result<u32> {
    u32::try_from(n).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many items"))
}

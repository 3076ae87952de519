//! Per-message summary records.
//!
//! [`MessageInfo`] is the plain data of one record. Records that live in a
//! summary are reached through counted references (`summary::InfoRef`);
//! records that do not belong to any summary can be shared through
//! [`StandaloneInfo`]. Code that does not care which kind it holds uses the
//! [`MessageInfoView`] and [`SharedMessageInfo`] traits.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::trace;

use crate::model::address;
use crate::model::content_info::{ContentInfo, ContentType};
use crate::model::flags::MessageFlags;
use crate::model::message_id::MessageId;
use crate::parser::header::{self, RawHeaders};
use crate::parser::mime::{MimeParser, MimeState};
use crate::summary::context::SummaryContext;
use crate::summary::indexer::IndexTarget;
use crate::summary::locks;

/// User tag holding a non-normal priority (`"high"` or `"low"`).
pub const PRIORITY_TAG: &str = "priority";

/// Summary data of one message.
///
/// Text fields are never absent: a missing header is an empty string.
#[derive(Debug, Clone)]
pub struct MessageInfo<E = ()> {
    /// Unique within a folder. Empty until the record is added to a summary.
    pub uid: Arc<str>,
    /// Size of the raw message in bytes.
    pub size: u32,
    pub flags: MessageFlags,
    /// Seconds since the epoch.
    pub date_sent: i64,
    /// Seconds since the epoch.
    pub date_received: i64,
    pub subject: Arc<str>,
    pub from: Arc<str>,
    pub to: Arc<str>,
    pub cc: Arc<str>,
    /// Mailing list the message arrived through.
    pub mlist: Arc<str>,
    pub message_id: MessageId,
    /// Ancestors, oldest first.
    pub references: Vec<MessageId>,
    pub user_flags: Vec<Arc<str>>,
    pub user_tags: Vec<(Arc<str>, Arc<str>)>,
    pub content: Option<Arc<ContentInfo>>,
    /// Backend extension data.
    pub extra: E,
}

impl<E: Default> Default for MessageInfo<E> {
    fn default() -> Self {
        let empty: Arc<str> = Arc::from("");
        Self {
            uid: Arc::clone(&empty),
            size: 0,
            flags: MessageFlags::empty(),
            date_sent: 0,
            date_received: 0,
            subject: Arc::clone(&empty),
            from: Arc::clone(&empty),
            to: Arc::clone(&empty),
            cc: Arc::clone(&empty),
            mlist: empty,
            message_id: MessageId::default(),
            references: Vec::new(),
            user_flags: Vec::new(),
            user_tags: Vec::new(),
            content: None,
            extra: E::default(),
        }
    }
}

impl<E: Default> MessageInfo<E> {
    /// Build a record from a message's header block.
    ///
    /// Text is decoded with the charset declared in `Content-Type`.
    /// Missing or unparseable dates default to now. With a context, text
    /// fields are interned in its string pool.
    pub fn new_from_header(context: Option<&SummaryContext>, headers: &RawHeaders) -> Self {
        let intern = |s: &str| -> Arc<str> {
            match context {
                Some(ctx) => ctx.intern(s),
                None => Arc::from(s),
            }
        };

        let content_type = headers
            .get("content-type")
            .map(|v| ContentType::parse(&v))
            .unwrap_or_default();
        let charset = content_type.param("charset");
        let text = |name: &str| headers.get_decoded(name, charset).unwrap_or_default();

        let mut flags = MessageFlags::empty();
        let has_attach_header = headers
            .get("x-ms-has-attach")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("yes"));
        if has_attach_header || content_type.is("multipart", "mixed") {
            flags |= MessageFlags::ATTACHMENTS;
        }

        let now = Utc::now().timestamp();
        let date_sent = headers
            .get("date")
            .and_then(|d| header::parse_date(&d))
            .map(|d| d.timestamp())
            .unwrap_or(now);
        let date_received = header::received_date(headers)
            .map(|d| d.timestamp())
            .unwrap_or(now);

        let message_id = headers
            .get("message-id")
            .map(|v| MessageId::from_header(&v))
            .unwrap_or_default();
        let references = MessageId::references(
            headers.get("references").as_deref(),
            headers.get("in-reply-to").as_deref(),
        );

        let mut user_tags = Vec::new();
        if let Some(priority) = priority(headers) {
            user_tags.push((intern(PRIORITY_TAG), intern(priority)));
        }

        let info = Self {
            uid: Arc::from(""),
            size: 0,
            flags,
            date_sent,
            date_received,
            subject: intern(text("subject").trim()),
            from: intern(&address::format_list(&text("from"))),
            to: intern(&address::format_list(&text("to"))),
            cc: intern(&address::format_list(&text("cc"))),
            mlist: intern(&header::mailing_list(headers).unwrap_or_default()),
            message_id,
            references,
            user_flags: Vec::new(),
            user_tags,
            content: None,
            extra: E::default(),
        };
        trace!(subject = %info.subject, id = %info.message_id, "Built record from headers");
        info
    }

    /// Build a record from the message at the parser's position, consuming
    /// its MIME structure when `build_content` is set.
    ///
    /// Returns `None` when the parser has nothing left.
    pub fn new_from_parser(
        context: Option<&SummaryContext>,
        parser: &mut MimeParser<'_>,
        build_content: bool,
        index: Option<IndexTarget<'_>>,
    ) -> Option<Self> {
        match parser.step() {
            MimeState::Header | MimeState::Multipart | MimeState::Message => {}
            _ => {
                parser.unstep();
                return None;
            }
        }
        let mut info = Self::new_from_header(context, parser.headers()?);
        info.size = u32::try_from(parser.data().len()).unwrap_or(u32::MAX);
        parser.unstep();

        if build_content {
            if let Some(content) = ContentInfo::new_from_parser(parser, index) {
                info.attach_content(content);
            }
        }
        Some(info)
    }

    /// Build a record from a message parsed by `mail-parser`.
    pub fn new_from_message(
        context: Option<&SummaryContext>,
        message: &mail_parser::Message<'_>,
        build_content: bool,
        index: Option<IndexTarget<'_>>,
    ) -> Self {
        let raw: &[u8] = message.raw_message.as_ref();
        let mut info = Self::new_from_header(context, &RawHeaders::parse(raw));
        info.size = u32::try_from(raw.len()).unwrap_or(u32::MAX);
        if build_content {
            info.attach_content(ContentInfo::new_from_message(message, index));
        }
        info
    }
}

impl<E> MessageInfo<E> {
    fn attach_content(&mut self, content: ContentInfo) {
        if content.has_attachments() {
            self.flags |= MessageFlags::ATTACHMENTS;
        }
        self.content = Some(Arc::new(content));
    }

    /// Change the bits in `mask` to their value in `set`. Bits outside the
    /// mask, including ones this build does not know, are kept. Returns
    /// `false` when nothing changed.
    pub fn set_flags(&mut self, mask: MessageFlags, set: MessageFlags) -> bool {
        let new = self.flags.difference(mask).union(set.intersection(mask));
        if new == self.flags {
            return false;
        }
        self.flags = new;
        true
    }

    /// Add or remove a user flag. Returns `false` when nothing changed.
    pub fn set_user_flag(&mut self, name: &str, value: bool) -> bool {
        self.set_user_flag_with(name, value, |s: &str| Arc::from(s))
    }

    pub(crate) fn set_user_flag_with(
        &mut self,
        name: &str,
        value: bool,
        intern: impl FnOnce(&str) -> Arc<str>,
    ) -> bool {
        let position = self.user_flags.iter().position(|f| &**f == name);
        match (position, value) {
            (None, true) => {
                self.user_flags.push(intern(name));
                true
            }
            (Some(i), false) => {
                self.user_flags.remove(i);
                true
            }
            _ => false,
        }
    }

    /// Set a user tag; `None` or an empty value removes it. Returns `false`
    /// when nothing changed.
    pub fn set_user_tag(&mut self, name: &str, value: Option<&str>) -> bool {
        self.set_user_tag_with(name, value, |s: &str| Arc::from(s))
    }

    pub(crate) fn set_user_tag_with(
        &mut self,
        name: &str,
        value: Option<&str>,
        intern: impl Fn(&str) -> Arc<str>,
    ) -> bool {
        let value = value.filter(|v| !v.is_empty());
        let position = self.user_tags.iter().position(|(n, _)| &**n == name);
        match (position, value) {
            (None, None) => false,
            (None, Some(v)) => {
                self.user_tags.push((intern(name), intern(v)));
                true
            }
            (Some(i), None) => {
                self.user_tags.remove(i);
                true
            }
            (Some(i), Some(v)) => {
                if &*self.user_tags[i].1 == v {
                    return false;
                }
                self.user_tags[i].1 = intern(v);
                true
            }
        }
    }
}

/// `high`, `low`, or `None` for normal priority.
fn priority(headers: &RawHeaders) -> Option<&'static str> {
    if let Some(value) = headers.get("x-priority") {
        // "1 (Highest)", "5 (Lowest)"
        return match value.trim().chars().next() {
            Some('1' | '2') => Some("high"),
            Some('4' | '5') => Some("low"),
            _ => None,
        };
    }
    for name in ["x-msmail-priority", "importance"] {
        if let Some(value) = headers.get(name) {
            let value = value.trim().to_ascii_lowercase();
            return match value.as_str() {
                "high" | "urgent" => Some("high"),
                "low" | "non-urgent" => Some("low"),
                _ => None,
            };
        }
    }
    None
}

/// Read access to a record, whatever holds it.
pub trait MessageInfoView {
    fn uid(&self) -> Arc<str>;
    fn size(&self) -> u32;
    fn flags(&self) -> MessageFlags;
    fn date_sent(&self) -> i64;
    fn date_received(&self) -> i64;
    fn subject(&self) -> Arc<str>;
    fn from(&self) -> Arc<str>;
    fn to(&self) -> Arc<str>;
    fn cc(&self) -> Arc<str>;
    fn mlist(&self) -> Arc<str>;
    fn message_id(&self) -> MessageId;
    fn references(&self) -> Vec<MessageId>;
    fn user_flag(&self, name: &str) -> bool;
    fn user_flags(&self) -> Vec<Arc<str>>;
    fn user_tag(&self, name: &str) -> Option<Arc<str>>;
    fn user_tags(&self) -> Vec<(Arc<str>, Arc<str>)>;
    fn content(&self) -> Option<Arc<ContentInfo>>;
}

/// Mutation through a shared handle.
pub trait SharedMessageInfo: MessageInfoView + Send + Sync {
    fn set_flags(&self, mask: MessageFlags, set: MessageFlags) -> bool;
    fn set_user_flag(&self, name: &str, value: bool) -> bool;
    fn set_user_tag(&self, name: &str, value: Option<&str>) -> bool;
}

impl<E> MessageInfoView for MessageInfo<E> {
    fn uid(&self) -> Arc<str> {
        Arc::clone(&self.uid)
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn flags(&self) -> MessageFlags {
        self.flags
    }

    fn date_sent(&self) -> i64 {
        self.date_sent
    }

    fn date_received(&self) -> i64 {
        self.date_received
    }

    fn subject(&self) -> Arc<str> {
        Arc::clone(&self.subject)
    }

    fn from(&self) -> Arc<str> {
        Arc::clone(&self.from)
    }

    fn to(&self) -> Arc<str> {
        Arc::clone(&self.to)
    }

    fn cc(&self) -> Arc<str> {
        Arc::clone(&self.cc)
    }

    fn mlist(&self) -> Arc<str> {
        Arc::clone(&self.mlist)
    }

    fn message_id(&self) -> MessageId {
        self.message_id
    }

    fn references(&self) -> Vec<MessageId> {
        self.references.clone()
    }

    fn user_flag(&self, name: &str) -> bool {
        self.user_flags.iter().any(|f| &**f == name)
    }

    fn user_flags(&self) -> Vec<Arc<str>> {
        self.user_flags.clone()
    }

    fn user_tag(&self, name: &str) -> Option<Arc<str>> {
        self.user_tags
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, v)| Arc::clone(v))
    }

    fn user_tags(&self) -> Vec<(Arc<str>, Arc<str>)> {
        self.user_tags.clone()
    }

    fn content(&self) -> Option<Arc<ContentInfo>> {
        self.content.clone()
    }
}

/// Implements [`MessageInfoView`] for a type with a `read()` method
/// returning a guard over a [`MessageInfo`].
macro_rules! view_through_read {
    () => {
        fn uid(&self) -> ::std::sync::Arc<str> {
            $crate::model::message_info::MessageInfoView::uid(&*self.read())
        }
        fn size(&self) -> u32 {
            self.read().size
        }
        fn flags(&self) -> $crate::model::flags::MessageFlags {
            self.read().flags
        }
        fn date_sent(&self) -> i64 {
            self.read().date_sent
        }
        fn date_received(&self) -> i64 {
            self.read().date_received
        }
        fn subject(&self) -> ::std::sync::Arc<str> {
            ::std::sync::Arc::clone(&self.read().subject)
        }
        fn from(&self) -> ::std::sync::Arc<str> {
            ::std::sync::Arc::clone(&self.read().from)
        }
        fn to(&self) -> ::std::sync::Arc<str> {
            ::std::sync::Arc::clone(&self.read().to)
        }
        fn cc(&self) -> ::std::sync::Arc<str> {
            ::std::sync::Arc::clone(&self.read().cc)
        }
        fn mlist(&self) -> ::std::sync::Arc<str> {
            ::std::sync::Arc::clone(&self.read().mlist)
        }
        fn message_id(&self) -> $crate::model::message_id::MessageId {
            self.read().message_id
        }
        fn references(&self) -> Vec<$crate::model::message_id::MessageId> {
            self.read().references.clone()
        }
        fn user_flag(&self, name: &str) -> bool {
            $crate::model::message_info::MessageInfoView::user_flag(&*self.read(), name)
        }
        fn user_flags(&self) -> Vec<::std::sync::Arc<str>> {
            self.read().user_flags.clone()
        }
        fn user_tag(&self, name: &str) -> Option<::std::sync::Arc<str>> {
            $crate::model::message_info::MessageInfoView::user_tag(&*self.read(), name)
        }
        fn user_tags(&self) -> Vec<(::std::sync::Arc<str>, ::std::sync::Arc<str>)> {
            self.read().user_tags.clone()
        }
        fn content(&self) -> Option<::std::sync::Arc<$crate::model::content_info::ContentInfo>> {
            self.read().content.clone()
        }
    };
}
pub(crate) use view_through_read;

/// A shared record that belongs to no summary. Changes are not tracked or
/// announced.
#[derive(Debug)]
pub struct StandaloneInfo<E = ()> {
    inner: Arc<RwLock<MessageInfo<E>>>,
}

impl<E> Clone for StandaloneInfo<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> StandaloneInfo<E> {
    pub fn new(info: MessageInfo<E>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(info)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, MessageInfo<E>> {
        locks::read(&self.inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, MessageInfo<E>> {
        locks::write(&self.inner)
    }

    /// Copy of the record data.
    pub fn snapshot(&self) -> MessageInfo<E>
    where
        E: Clone,
    {
        self.read().clone()
    }
}

impl<E> MessageInfoView for StandaloneInfo<E> {
    view_through_read!();
}

impl<E: Send + Sync> SharedMessageInfo for StandaloneInfo<E> {
    fn set_flags(&self, mask: MessageFlags, set: MessageFlags) -> bool {
        self.write().set_flags(mask, set)
    }

    fn set_user_flag(&self, name: &str, value: bool) -> bool {
        self.write().set_user_flag(name, value)
    }

    fn set_user_tag(&self, name: &str, value: Option<&str>) -> bool {
        self.write().set_user_tag(name, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADERS: &[u8] = b"From: \"Ana Ruiz\" <ana@example.com>\r\n\
To: bob@example.com, Carol <carol@example.com>\r\n\
Cc: =?UTF-8?B?SsO8cmdlbg==?= <jurgen@example.de>\r\n\
Subject: =?ISO-8859-1?Q?Caf=E9?= plans\r\n\
Date: Thu, 04 Jan 2024 10:00:00 +0000\r\n\
Received: from mx by mail; Thu, 04 Jan 2024 10:00:05 +0000\r\n\
Message-ID: <plans@example.com>\r\n\
In-Reply-To: <earlier@example.com>\r\n\
List-Id: Coffee <coffee.lists.example.com>\r\n\
X-Priority: 1 (Highest)\r\n\
Content-Type: multipart/mixed; boundary=\"b\"\r\n\
\r\n";

    #[test]
    fn test_new_from_header() {
        let info: MessageInfo = MessageInfo::new_from_header(None, &RawHeaders::parse(HEADERS));
        assert_eq!(&*info.subject, "Café plans");
        assert_eq!(&*info.from, "Ana Ruiz <ana@example.com>");
        assert_eq!(&*info.to, "bob@example.com, Carol <carol@example.com>");
        assert_eq!(&*info.cc, "Jürgen <jurgen@example.de>");
        assert_eq!(&*info.mlist, "coffee.lists.example.com");
        assert_eq!(info.date_sent, 1_704_362_400);
        assert_eq!(info.date_received, 1_704_362_405);
        assert_eq!(info.message_id, MessageId::from_header("<plans@example.com>"));
        assert_eq!(info.references, vec![MessageId::from_header("<earlier@example.com>")]);
        assert!(info.flags.contains(MessageFlags::ATTACHMENTS));
        assert_eq!(info.user_tag(PRIORITY_TAG).as_deref(), Some("high"));
        assert!(info.uid.is_empty());
    }

    #[test]
    fn test_missing_headers_default() {
        let before = Utc::now().timestamp();
        let info: MessageInfo = MessageInfo::new_from_header(None, &RawHeaders::default());
        assert_eq!(&*info.subject, "");
        assert!(info.message_id.is_empty());
        assert!(info.date_sent >= before);
        assert!(info.date_received >= before);
        assert!(info.user_tags.is_empty());
    }

    #[test]
    fn test_priority_headers() {
        let low = RawHeaders::from_pairs([("X-MSMail-Priority", "Low")]);
        assert_eq!(priority(&low), Some("low"));
        let high = RawHeaders::from_pairs([("Importance", "high")]);
        assert_eq!(priority(&high), Some("high"));
        let normal = RawHeaders::from_pairs([("X-Priority", "3 (Normal)")]);
        assert_eq!(priority(&normal), None);
    }

    #[test]
    fn test_has_attach_header() {
        let headers = RawHeaders::from_pairs([("X-MS-Has-Attach", "yes")]);
        let info: MessageInfo = MessageInfo::new_from_header(None, &headers);
        assert!(info.flags.contains(MessageFlags::ATTACHMENTS));
    }

    #[test]
    fn test_context_interns_text() {
        let ctx = SummaryContext::default();
        let headers = RawHeaders::from_pairs([("Subject", "same")]);
        let a: MessageInfo = MessageInfo::new_from_header(Some(&ctx), &headers);
        let b: MessageInfo = MessageInfo::new_from_header(Some(&ctx), &headers);
        assert!(Arc::ptr_eq(&a.subject, &b.subject));
    }

    #[test]
    fn test_new_from_parser_with_content() {
        let raw = b"Subject: report\nContent-Type: multipart/mixed; boundary=X\n\n--X\nContent-Type: text/plain\n\nsee attached\n--X\nContent-Type: application/pdf\n\nPDF\n--X--\n";
        let mut parser = MimeParser::new(raw);
        let info: MessageInfo =
            MessageInfo::new_from_parser(None, &mut parser, true, None).unwrap();
        assert_eq!(&*info.subject, "report");
        assert_eq!(info.size as usize, raw.len());
        let content = info.content.unwrap();
        assert_eq!(content.children.len(), 2);
        assert_eq!(parser.step(), MimeState::Eof);
    }

    #[test]
    fn test_new_from_parser_at_eof() {
        let mut parser = MimeParser::new(b"Subject: x\n\nbody\n");
        while parser.step() != MimeState::Eof {}
        let info: Option<MessageInfo> = MessageInfo::new_from_parser(None, &mut parser, true, None);
        assert!(info.is_none());
    }

    #[test]
    fn test_new_from_message() {
        let raw = b"From: a@example.com\nSubject: parsed\nContent-Type: text/plain\n\nhello\n";
        let message = mail_parser::MessageParser::default().parse(&raw[..]).unwrap();
        let info: MessageInfo = MessageInfo::new_from_message(None, &message, true, None);
        assert_eq!(&*info.subject, "parsed");
        assert!(info.content.unwrap().content_type.is("text", "plain"));
        assert_eq!(info.size as usize, raw.len());
    }

    #[test]
    fn test_set_flags_respects_mask() {
        let mut info: MessageInfo = MessageInfo::default();
        info.flags = MessageFlags::from_raw(0x8000_0000) | MessageFlags::DRAFT;
        assert!(info.set_flags(MessageFlags::SEEN, MessageFlags::SEEN | MessageFlags::FLAGGED));
        assert_eq!(
            info.flags,
            MessageFlags::from_raw(0x8000_0000) | MessageFlags::DRAFT | MessageFlags::SEEN
        );
        assert!(!info.set_flags(MessageFlags::SEEN, MessageFlags::SEEN));
        assert!(info.set_flags(MessageFlags::DRAFT, MessageFlags::empty()));
        assert!(!info.flags.contains(MessageFlags::DRAFT));
    }

    #[test]
    fn test_user_flags_and_tags() {
        let mut info: MessageInfo = MessageInfo::default();
        assert!(info.set_user_flag("$Work", true));
        assert!(!info.set_user_flag("$Work", true));
        assert!(info.user_flag("$Work"));
        assert!(info.set_user_flag("$Work", false));
        assert!(!info.set_user_flag("$Work", false));

        assert!(info.set_user_tag("label", Some("red")));
        assert!(!info.set_user_tag("label", Some("red")));
        assert!(info.set_user_tag("label", Some("blue")));
        assert_eq!(info.user_tag("label").as_deref(), Some("blue"));
        assert!(info.set_user_tag("label", Some("")));
        assert!(info.user_tag("label").is_none());
        assert!(!info.set_user_tag("label", None));
    }

    #[test]
    fn test_standalone_info_is_shared() {
        let info = StandaloneInfo::new(MessageInfo::<()>::default());
        let other = info.clone();
        assert!(info.set_flags(MessageFlags::SEEN, MessageFlags::SEEN));
        assert!(other.flags().contains(MessageFlags::SEEN));
        let shared: Arc<dyn SharedMessageInfo> = Arc::new(other);
        assert!(shared.set_user_flag("x", true));
        assert!(info.user_flag("x"));
    }
}

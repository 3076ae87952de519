//! Record layout.
//!
//! ```text
//! uid: string
//! size: u32
//! flags: u32
//! date_sent: time
//! date_received: time
//! subject, from, to, cc, mailing_list: string
//! message_id: u32 hi, u32 lo
//! references: u32 n, n × (u32 hi, u32 lo)
//! user_flags: u32 n, n × string
//! user_tags: u32 n, n × (string name, string value)
//! backend extension
//! content tree                       (when the header has FLAG_CONTENT)
//! ```

use std::io::{self, Write};
use std::sync::Arc;

use crate::model::content_info::ContentInfo;
use crate::model::flags::MessageFlags;
use crate::model::message_id::MessageId;
use crate::model::message_info::MessageInfo;

use super::backend::SummaryBackend;
use super::codec::{encode_string, encode_time, encode_u32, DecodeError, Decoder};
use super::context::SummaryContext;

/// No more than this many user flags or tags per record.
const MAX_USER_ITEMS: usize = 1024;

pub fn encode_record<B: SummaryBackend>(
    backend: &B,
    info: &MessageInfo<B::Extra>,
    with_content: bool,
    w: &mut dyn Write,
) -> io::Result<()> {
    encode_string(w, Some(&info.uid))?;
    encode_u32(w, info.size)?;
    encode_u32(w, info.flags.bits())?;
    encode_time(w, info.date_sent)?;
    encode_time(w, info.date_received)?;
    for text in [&info.subject, &info.from, &info.to, &info.cc, &info.mlist] {
        encode_string(w, Some(text))?;
    }

    encode_u32(w, info.message_id.hi)?;
    encode_u32(w, info.message_id.lo)?;
    encode_u32(w, len_u32(info.references.len())?)?;
    for id in &info.references {
        encode_u32(w, id.hi)?;
        encode_u32(w, id.lo)?;
    }

    encode_u32(w, len_u32(info.user_flags.len())?)?;
    for name in &info.user_flags {
        encode_string(w, Some(name))?;
    }
    encode_u32(w, len_u32(info.user_tags.len())?)?;
    for (name, value) in &info.user_tags {
        encode_string(w, Some(name))?;
        encode_string(w, Some(value))?;
    }

    backend.extra_save(&info.extra, w)?;

    if with_content {
        ContentInfo::save(info.content.as_deref(), w)?;
    }
    Ok(())
}

/// Decode one record. Text fields are interned in `context`; an absent
/// string decodes as empty.
pub fn decode_record<B: SummaryBackend>(
    backend: &B,
    dec: &mut Decoder<'_>,
    with_content: bool,
    context: &SummaryContext,
) -> Result<MessageInfo<B::Extra>, DecodeError> {
    let uid: Arc<str> = Arc::from(dec.decode_str()?.unwrap_or_default().as_ref());
    let size = dec.decode_u32()?;
    let flags = MessageFlags::from_raw(dec.decode_u32()?);
    let date_sent = dec.decode_time()?;
    let date_received = dec.decode_time()?;

    let mut text = || -> Result<Arc<str>, DecodeError> {
        Ok(context.intern(&dec.decode_str()?.unwrap_or_default()))
    };
    let subject = text()?;
    let from = text()?;
    let to = text()?;
    let cc = text()?;
    let mlist = text()?;

    let message_id = MessageId::from_parts(dec.decode_u32()?, dec.decode_u32()?);
    let ref_count = dec.decode_count("reference", usize::MAX, 8)?;
    let mut references = Vec::with_capacity(ref_count);
    for _ in 0..ref_count {
        references.push(MessageId::from_parts(dec.decode_u32()?, dec.decode_u32()?));
    }

    let flag_count = dec.decode_count("user flag", MAX_USER_ITEMS, 4)?;
    let mut user_flags = Vec::with_capacity(flag_count);
    for _ in 0..flag_count {
        if let Some(name) = dec.decode_str()? {
            user_flags.push(context.intern(&name));
        }
    }

    let tag_count = dec.decode_count("user tag", MAX_USER_ITEMS, 8)?;
    let mut user_tags = Vec::with_capacity(tag_count);
    for _ in 0..tag_count {
        let name = dec.decode_str()?;
        let value = dec.decode_str()?;
        if let Some(name) = name {
            user_tags.push((
                context.intern(&name),
                context.intern(&value.unwrap_or_default()),
            ));
        }
    }

    let extra = backend.extra_load(dec)?;

    let content = if with_content {
        Some(Arc::new(ContentInfo::load(dec)?))
    } else {
        None
    };

    Ok(MessageInfo {
        uid,
        size,
        flags,
        date_sent,
        date_received,
        subject,
        from,
        to,
        cc,
        mlist,
        message_id,
        references,
        user_flags,
        user_tags,
        content,
        extra,
    })
}

fn len_u32(n: usize) -> io::Result<u32> {
    u32::try_from(n).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "list too long"))
}

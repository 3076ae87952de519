//! Summary of an mbox file.
//!
//! Each record remembers the offset of its `From ` line, and the header
//! remembers the size and modification time of the mbox it was built from.
//! [`FolderSummary::sync_from_mbox`] brings the summary up to date: a file
//! that only grew is scanned from the old end, anything else is rescanned
//! completely while keeping uids and flags of messages it already knew.
//!
//! ```text
//! header extension:  u32 version (1), u64 folder_size, time mtime
//! record extension:  u64 from_offset
//! ```

use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, SummaryError};
use crate::model::flags::MessageFlags;
use crate::model::message_id::MessageId;
use crate::model::message_info::MessageInfo;
use crate::parser::header::RawHeaders;
use crate::parser::mbox::{MboxParser, RawMessage, DEFAULT_READ_BUFFER_SIZE};
use crate::parser::mime::MimeParser;

use super::backend::SummaryBackend;
use super::codec::{encode_time, encode_u32, encode_u64, DecodeError, Decoder};
use super::folder::FolderSummary;

/// Version of the mbox header extension.
pub const MBOX_SUMMARY_VERSION: u32 = 1;

/// Flags mirrored in `Status` / `X-Status` headers.
pub const STATUS_FLAGS: MessageFlags = MessageFlags::SEEN
    .union(MessageFlags::ANSWERED)
    .union(MessageFlags::FLAGGED)
    .union(MessageFlags::DELETED)
    .union(MessageFlags::DRAFT);

#[derive(Debug, Clone, Copy, Default)]
pub struct MboxBackend;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MboxHeader {
    /// Size of the mbox when the summary was last synced.
    pub folder_size: u64,
    /// Modification time (seconds) of the mbox when last synced.
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MboxExtra {
    /// Offset of the message's `From ` line.
    pub from_offset: u64,
}

pub type MboxSummary = FolderSummary<MboxBackend>;
pub type MboxInfo = MessageInfo<MboxExtra>;

impl SummaryBackend for MboxBackend {
    type Extra = MboxExtra;
    type Header = MboxHeader;

    fn name(&self) -> &'static str {
        "mbox"
    }

    fn header_save(&self, header: &MboxHeader, w: &mut dyn Write) -> io::Result<()> {
        encode_u32(w, MBOX_SUMMARY_VERSION)?;
        encode_u64(w, header.folder_size)?;
        encode_time(w, header.mtime)
    }

    fn header_load(&self, dec: &mut Decoder<'_>) -> std::result::Result<MboxHeader, DecodeError> {
        let version = dec.decode_u32()?;
        if version != MBOX_SUMMARY_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        Ok(MboxHeader {
            folder_size: dec.decode_u64()?,
            mtime: dec.decode_time()?,
        })
    }

    fn extra_save(&self, extra: &MboxExtra, w: &mut dyn Write) -> io::Result<()> {
        encode_u64(w, extra.from_offset)
    }

    fn extra_load(&self, dec: &mut Decoder<'_>) -> std::result::Result<MboxExtra, DecodeError> {
        Ok(MboxExtra {
            from_offset: dec.decode_u64()?,
        })
    }
}

/// Flags encoded in the `Status` (`R`) and `X-Status` (`A`, `F`, `D`, `T`)
/// headers written by mbox clients.
pub fn status_flags(headers: &RawHeaders) -> MessageFlags {
    let mut flags = MessageFlags::empty();
    if let Some(status) = headers.get("status") {
        if status.contains('R') {
            flags |= MessageFlags::SEEN;
        }
    }
    if let Some(x_status) = headers.get("x-status") {
        for c in x_status.chars() {
            flags |= match c {
                'A' => MessageFlags::ANSWERED,
                'F' => MessageFlags::FLAGGED,
                'D' => MessageFlags::DELETED,
                'T' => MessageFlags::DRAFT,
                _ => MessageFlags::empty(),
            };
        }
    }
    flags
}

/// `Status` and `X-Status` values for `flags`.
pub fn status_headers(flags: MessageFlags) -> (String, String) {
    let mut status = String::new();
    if flags.contains(MessageFlags::SEEN) {
        status.push('R');
    }
    status.push('O');
    let x_status = [
        (MessageFlags::ANSWERED, 'A'),
        (MessageFlags::FLAGGED, 'F'),
        (MessageFlags::DELETED, 'D'),
        (MessageFlags::DRAFT, 'T'),
    ]
    .iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, c)| *c)
    .collect();
    (status, x_status)
}

/// What a sync did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Messages that were not in the summary before.
    pub added: usize,
    /// Records that no longer have a message.
    pub removed: usize,
    /// Records that kept their uid.
    pub kept: usize,
    /// Whether the whole file was rescanned.
    pub full: bool,
}

/// User state carried over a full rescan.
struct Carried {
    uid: Arc<str>,
    flags: MessageFlags,
    user_flags: Vec<Arc<str>>,
    user_tags: Vec<(Arc<str>, Arc<str>)>,
}

/// Size and modification time of `path`.
pub(crate) fn stat(path: &Path) -> Result<MboxHeader> {
    let meta = std::fs::metadata(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            SummaryError::FileNotFound(path.to_path_buf())
        } else {
            SummaryError::io(path, e)
        }
    })?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0);
    Ok(MboxHeader {
        folder_size: meta.len(),
        mtime,
    })
}

impl FolderSummary<MboxBackend> {
    /// Build a record from one raw mbox message, keeping `uid` when given.
    /// The size is the message's span in the file, even when the parser
    /// handed over fewer bytes.
    fn info_from_raw(
        &self,
        message: &RawMessage<'_>,
        headers: &RawHeaders,
        uid: Option<Arc<str>>,
    ) -> Option<MboxInfo> {
        let mut parser = MimeParser::new(message.data);
        let mut info = self.info_new_from_parser_as(&mut parser, uid)?;
        info.flags |= status_flags(headers);
        info.size = u32::try_from(message.span).unwrap_or(u32::MAX);
        info.extra.from_offset = message.offset;
        Some(info)
    }

    /// Bring the summary in line with the mbox at `path`.
    pub fn sync_from_mbox(
        &self,
        path: &Path,
        progress: Option<&dyn Fn(u64, u64)>,
    ) -> Result<SyncReport> {
        let parser = MboxParser::new(path)?.with_buffer_size(DEFAULT_READ_BUFFER_SIZE);
        self.sync_with_parser(&parser, progress)
    }

    /// Like [`FolderSummary::sync_from_mbox`], reading through `parser`.
    pub fn sync_with_parser(
        &self,
        parser: &MboxParser,
        progress: Option<&dyn Fn(u64, u64)>,
    ) -> Result<SyncReport> {
        let path = parser.path();
        let current = stat(path)?;
        let known = self.backend_header();
        let count = self.count();

        if count > 0 && known == current {
            debug!(folder = %self.name(), "Mbox unchanged");
            return Ok(SyncReport {
                kept: count,
                ..SyncReport::default()
            });
        }

        let grew = count > 0
            && known.folder_size > 0
            && current.folder_size > known.folder_size
            && MboxParser::separator_at(path, known.folder_size)?;

        let report = if grew {
            self.sync_appended(parser, known.folder_size, count, progress)?
        } else {
            self.sync_full(parser, progress)?
        };
        self.set_backend_header(current);
        info!(
            folder = %self.name(),
            added = report.added,
            removed = report.removed,
            kept = report.kept,
            full = report.full,
            "Synced mbox"
        );
        Ok(report)
    }

    fn sync_appended(
        &self,
        parser: &MboxParser,
        start: u64,
        count: usize,
        progress: Option<&dyn Fn(u64, u64)>,
    ) -> Result<SyncReport> {
        debug!(folder = %self.name(), start, "Scanning appended mbox data");
        let mut added = 0;
        parser.parse_from(
            start,
            &mut |message| {
                let headers = RawHeaders::parse(message.data);
                if let Some(info) = self.info_from_raw(&message, &headers, None) {
                    self.add(info);
                    added += 1;
                }
                true
            },
            progress,
        )?;
        Ok(SyncReport {
            added,
            removed: 0,
            kept: count,
            full: false,
        })
    }

    /// Rescan the whole file. Old records are dropped first so the body
    /// index sees the rebuilt ones last; if the scan fails they are put
    /// back.
    fn sync_full(&self, parser: &MboxParser, progress: Option<&dyn Fn(u64, u64)>) -> Result<SyncReport> {
        debug!(folder = %self.name(), "Rescanning whole mbox");
        let previous: Vec<MboxInfo> = self.array().iter().map(|info| info.snapshot()).collect();
        let mut carried: HashMap<MessageId, VecDeque<Carried>> = HashMap::new();
        for info in previous.iter().filter(|info| !info.message_id.is_empty()) {
            carried.entry(info.message_id).or_default().push_back(Carried {
                uid: Arc::clone(&info.uid),
                flags: info.flags,
                user_flags: info.user_flags.clone(),
                user_tags: info.user_tags.clone(),
            });
        }

        self.clear();
        self.clear_expunged();
        let mut added = 0;
        let mut kept = 0;
        let scanned = parser.parse(
            &mut |message| {
                let headers = RawHeaders::parse(message.data);
                let id = headers
                    .get("message-id")
                    .map(|v| MessageId::from_header(&v))
                    .unwrap_or_default();
                let old = if id.is_empty() {
                    None
                } else {
                    carried.get_mut(&id).and_then(VecDeque::pop_front)
                };
                let uid = old.as_ref().map(|o| Arc::clone(&o.uid));
                if let Some(mut info) = self.info_from_raw(&message, &headers, uid) {
                    if let Some(old) = old {
                        info.flags = old.flags | info.flags.intersection(MessageFlags::ATTACHMENTS);
                        info.user_flags = old.user_flags;
                        info.user_tags = old.user_tags;
                        kept += 1;
                    } else {
                        added += 1;
                    }
                    self.add(info);
                }
                true
            },
            progress,
        );

        if let Err(e) = scanned {
            warn!(folder = %self.name(), error = %e, "Rescan failed, restoring records");
            self.clear();
            self.clear_expunged();
            for info in previous {
                self.add(info);
            }
            return Err(e);
        }
        Ok(SyncReport {
            added,
            removed: previous.len() - kept,
            kept,
            full: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message_info::{MessageInfoView, SharedMessageInfo};
    use crate::summary::context::SummaryContext;
    use crate::summary::folder::SummaryOptions;
    use std::fs;
    use std::io::Write;

    fn message(n: u32, extra_headers: &str) -> String {
        format!(
            "From sender@example.com Thu Jan 04 10:00:0{n} 2024\n\
Subject: message {n}\n\
Message-ID: <m{n}@example.com>\n\
{extra_headers}\
\n\
body {n}\n\
\n"
        )
    }

    fn summary(dir: &Path) -> MboxSummary {
        FolderSummary::new(
            dir.join(".inbox.summary"),
            MboxBackend,
            SummaryContext::shared(),
            SummaryOptions {
                fsync: false,
                ..SummaryOptions::default()
            },
        )
    }

    #[test]
    fn test_status_flags() {
        let headers = RawHeaders::from_pairs([("Status", "RO"), ("X-Status", "AF")]);
        let flags = status_flags(&headers);
        assert_eq!(
            flags,
            MessageFlags::SEEN | MessageFlags::ANSWERED | MessageFlags::FLAGGED
        );
        assert_eq!(status_headers(flags), ("RO".to_string(), "AF".to_string()));
        assert_eq!(status_headers(MessageFlags::DRAFT), ("O".to_string(), "T".to_string()));
    }

    #[test]
    fn test_full_sync_then_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mbox = dir.path().join("inbox");
        fs::write(&mbox, message(1, "") + &message(2, "Status: RO\n")).unwrap();

        let summary = summary(dir.path());
        let report = summary.sync_from_mbox(&mbox, None).unwrap();
        assert_eq!(report.added, 2);
        assert!(report.full);
        assert_eq!(summary.count(), 2);
        let second = summary.uid("2").unwrap();
        assert!(second.flags().contains(MessageFlags::SEEN));
        assert_eq!(second.extra().from_offset, message(1, "").len() as u64);
        drop(second);
        summary.save().unwrap();

        let reloaded = self::summary(dir.path());
        reloaded.load().unwrap();
        assert_eq!(reloaded.backend_header().folder_size, fs::metadata(&mbox).unwrap().len());
        assert_eq!(reloaded.uid("2").unwrap().extra(), MboxExtra {
            from_offset: message(1, "").len() as u64
        });
        let unchanged = reloaded.sync_from_mbox(&mbox, None).unwrap();
        assert_eq!(unchanged.kept, 2);
        assert_eq!(unchanged.added, 0);
    }

    #[test]
    fn test_appended_messages_are_scanned_incrementally() {
        let dir = tempfile::tempdir().unwrap();
        let mbox = dir.path().join("inbox");
        fs::write(&mbox, message(1, "")).unwrap();
        let summary = summary(dir.path());
        summary.sync_from_mbox(&mbox, None).unwrap();

        let mut file = fs::OpenOptions::new().append(true).open(&mbox).unwrap();
        file.write_all(message(2, "").as_bytes()).unwrap();
        drop(file);

        let report = summary.sync_from_mbox(&mbox, None).unwrap();
        assert!(!report.full);
        assert_eq!(report.added, 1);
        assert_eq!(summary.count(), 2);
        assert_eq!(&*summary.uid("2").unwrap().subject(), "message 2");
    }

    #[test]
    fn test_rescan_keeps_uids_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mbox = dir.path().join("inbox");
        fs::write(&mbox, message(1, "") + &message(2, "") + &message(3, "")).unwrap();
        let summary = summary(dir.path());
        summary.sync_from_mbox(&mbox, None).unwrap();
        summary
            .uid("3")
            .unwrap()
            .set_flags(MessageFlags::FLAGGED, MessageFlags::FLAGGED);

        // another client removed the first message
        fs::write(&mbox, message(2, "") + &message(3, "")).unwrap();
        let report = summary.sync_from_mbox(&mbox, None).unwrap();
        assert!(report.full);
        assert_eq!(report.kept, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(report.added, 0);
        let uids: Vec<String> = summary.uids().iter().map(|u| u.to_string()).collect();
        assert_eq!(uids, ["2", "3"]);
        let third = summary.uid("3").unwrap();
        assert!(third.flags().contains(MessageFlags::FLAGGED));
        assert_eq!(third.extra().from_offset, message(2, "").len() as u64);
    }

    #[test]
    fn test_wrong_extension_version_is_corrupt() {
        let mut buf = Vec::new();
        encode_u32(&mut buf, 7).unwrap();
        let result = MboxBackend.header_load(&mut Decoder::new(&buf));
        assert_eq!(result, Err(DecodeError::UnsupportedVersion(7)));
    }
}

//! Summary of a folder mirrored from an IMAP server.
//!
//! Records remember the flags the server last reported. A local flag change
//! that makes the visible flags differ from them sets FOLDER_FLAGGED, which
//! marks the record as needing an upload; [`FolderSummary::pending_sync`]
//! lists those records and [`FolderSummary::mark_synced`] clears the mark.
//!
//! ```text
//! header extension:  u32 version (1), u32 uid_validity
//! record extension:  u32 server_flags
//! ```

use std::io::{self, Write};
use std::sync::Arc;

use tracing::{info, warn};

use crate::model::flags::MessageFlags;
use crate::model::message_info::MessageInfo;

use super::backend::SummaryBackend;
use super::codec::{encode_u32, DecodeError, Decoder};
use super::folder::FolderSummary;
use super::info_ref::InfoRef;
use super::locks;

/// Version of the IMAP header extension.
pub const IMAP_SUMMARY_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct ImapBackend;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImapHeader {
    /// UIDVALIDITY of the mailbox; 0 when not known yet.
    pub uid_validity: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImapExtra {
    /// Flags as last reported by the server.
    pub server_flags: MessageFlags,
}

pub type ImapSummary = FolderSummary<ImapBackend>;

impl SummaryBackend for ImapBackend {
    type Extra = ImapExtra;
    type Header = ImapHeader;

    fn name(&self) -> &'static str {
        "imap"
    }

    fn header_save(&self, header: &ImapHeader, w: &mut dyn Write) -> io::Result<()> {
        encode_u32(w, IMAP_SUMMARY_VERSION)?;
        encode_u32(w, header.uid_validity)
    }

    fn header_load(&self, dec: &mut Decoder<'_>) -> Result<ImapHeader, DecodeError> {
        let version = dec.decode_u32()?;
        if version != IMAP_SUMMARY_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        Ok(ImapHeader {
            uid_validity: dec.decode_u32()?,
        })
    }

    fn extra_save(&self, extra: &ImapExtra, w: &mut dyn Write) -> io::Result<()> {
        encode_u32(w, extra.server_flags.bits())
    }

    fn extra_load(&self, dec: &mut Decoder<'_>) -> Result<ImapExtra, DecodeError> {
        Ok(ImapExtra {
            server_flags: MessageFlags::from_raw(dec.decode_u32()?),
        })
    }

    fn flags_changed(&self, info: &mut MessageInfo<ImapExtra>, _old: MessageFlags) {
        mark_if_diverged(info);
    }
}

/// Set or clear FOLDER_FLAGGED depending on whether local and server flags
/// agree.
fn mark_if_diverged(info: &mut MessageInfo<ImapExtra>) {
    let diverged = info.flags.visible() != info.extra.server_flags.visible();
    info.flags.set(MessageFlags::FOLDER_FLAGGED, diverged);
}

impl FolderSummary<ImapBackend> {
    pub fn uid_validity(&self) -> u32 {
        self.backend_header().uid_validity
    }

    /// Record the server's UIDVALIDITY. When it differs from a known value
    /// the server renumbered the mailbox and every record is dropped.
    /// Returns `true` in that case.
    pub fn set_uid_validity(&self, uid_validity: u32) -> bool {
        let known = self.uid_validity();
        if known == uid_validity {
            return false;
        }
        let reset = known != 0;
        if reset {
            warn!(folder = %self.name(), known, uid_validity, "UIDVALIDITY changed, dropping records");
            self.clear();
            self.clear_expunged();
        }
        self.set_backend_header(ImapHeader { uid_validity });
        reset
    }

    /// Add a message the server reported, with its server flags.
    pub fn add_from_server(&self, mut info: MessageInfo<ImapExtra>, server_flags: MessageFlags) -> InfoRef<ImapBackend> {
        info.flags = info.flags.intersection(MessageFlags::SYSTEM_MASK) | server_flags.visible();
        info.extra.server_flags = server_flags;
        mark_if_diverged(&mut info);
        self.add(info)
    }

    /// Take new server flags for `uid`. Local changes that are not yet
    /// uploaded win over the server's; otherwise the local flags follow.
    /// Returns `false` if no record has the uid.
    pub fn merge_server_flags(&self, uid: &str, server_flags: MessageFlags) -> bool {
        let Some(info) = self.uid(uid) else {
            return false;
        };
        let (uid, old, new) = {
            let mut record = locks::write(info.record());
            let old = record.flags;
            record.extra.server_flags = server_flags;
            if !old.contains(MessageFlags::FOLDER_FLAGGED) {
                record.flags = old.intersection(MessageFlags::SYSTEM_MASK) | server_flags.visible();
            }
            mark_if_diverged(&mut record);
            (Arc::clone(&record.uid), old, record.flags)
        };
        if (old ^ new).visible().is_empty() {
            self.touch();
        } else {
            self.announce_changed(uid);
        }
        true
    }

    /// Records with local changes the server has not seen.
    pub fn pending_sync(&self) -> Vec<InfoRef<ImapBackend>> {
        self.array()
            .into_iter()
            .filter(|info| info.read().flags.contains(MessageFlags::FOLDER_FLAGGED))
            .collect()
    }

    /// The server accepted the local flags of `info`.
    pub fn mark_synced(&self, info: &InfoRef<ImapBackend>) {
        {
            let mut record = locks::write(info.record());
            record.extra.server_flags = record.flags.visible();
            record.flags.remove(MessageFlags::FOLDER_FLAGGED);
        }
        self.touch();
        info!(folder = %self.name(), uid = %info.read().uid, "Flags synced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message_info::{MessageInfoView, SharedMessageInfo};
    use crate::summary::context::SummaryContext;
    use crate::summary::folder::SummaryOptions;

    fn summary(dir: &std::path::Path) -> ImapSummary {
        FolderSummary::new(
            dir.join(".INBOX.summary"),
            ImapBackend,
            SummaryContext::shared(),
            SummaryOptions {
                fsync: false,
                ..SummaryOptions::default()
            },
        )
    }

    fn server_message(uid: &str) -> MessageInfo<ImapExtra> {
        MessageInfo {
            uid: Arc::from(uid),
            ..MessageInfo::default()
        }
    }

    #[test]
    fn test_local_change_marks_record_for_upload() {
        let dir = tempfile::tempdir().unwrap();
        let summary = summary(dir.path());
        let info = summary.add_from_server(server_message("100"), MessageFlags::empty());
        assert!(summary.pending_sync().is_empty());

        info.set_flags(MessageFlags::SEEN, MessageFlags::SEEN);
        assert!(info.flags().contains(MessageFlags::FOLDER_FLAGGED));
        assert_eq!(summary.pending_sync().len(), 1);

        // undoing the change locally clears the mark again
        info.set_flags(MessageFlags::SEEN, MessageFlags::empty());
        assert!(!info.flags().contains(MessageFlags::FOLDER_FLAGGED));

        info.set_flags(MessageFlags::FLAGGED, MessageFlags::FLAGGED);
        summary.mark_synced(&info);
        assert!(summary.pending_sync().is_empty());
        assert_eq!(info.extra().server_flags, MessageFlags::FLAGGED);
    }

    #[test]
    fn test_server_flags_follow_unless_pending() {
        let dir = tempfile::tempdir().unwrap();
        let summary = summary(dir.path());
        let clean = summary.add_from_server(server_message("1"), MessageFlags::empty());
        let dirty = summary.add_from_server(server_message("2"), MessageFlags::empty());
        dirty.set_flags(MessageFlags::FLAGGED, MessageFlags::FLAGGED);

        assert!(summary.merge_server_flags("1", MessageFlags::SEEN));
        assert_eq!(clean.flags(), MessageFlags::SEEN);

        summary.merge_server_flags("2", MessageFlags::SEEN);
        assert!(dirty.flags().contains(MessageFlags::FLAGGED));
        assert!(!dirty.flags().contains(MessageFlags::SEEN));
        assert!(dirty.flags().contains(MessageFlags::FOLDER_FLAGGED));

        assert!(!summary.merge_server_flags("404", MessageFlags::SEEN));
    }

    #[test]
    fn test_uid_validity_change_drops_records() {
        let dir = tempfile::tempdir().unwrap();
        let summary = summary(dir.path());
        assert!(!summary.set_uid_validity(7));
        summary.add_from_server(server_message("1"), MessageFlags::SEEN);
        assert!(!summary.set_uid_validity(7));
        assert_eq!(summary.count(), 1);
        assert!(summary.set_uid_validity(8));
        assert_eq!(summary.count(), 0);
        assert_eq!(summary.uid_validity(), 8);
    }

    #[test]
    fn test_extensions_survive_save() {
        let dir = tempfile::tempdir().unwrap();
        let summary = summary(dir.path());
        summary.set_uid_validity(1234);
        summary.add_from_server(server_message("5"), MessageFlags::SEEN | MessageFlags::ANSWERED);
        summary.save().unwrap();

        let reloaded = self::summary(dir.path());
        reloaded.load().unwrap();
        assert_eq!(reloaded.uid_validity(), 1234);
        let info = reloaded.uid("5").unwrap();
        assert_eq!(
            info.extra().server_flags,
            MessageFlags::SEEN | MessageFlags::ANSWERED
        );
        assert!(!info.flags().contains(MessageFlags::FOLDER_FLAGGED));
    }
}

//! Virtual folders.
//!
//! A [`VeeSummary`] collects records that live in other summaries. Each
//! entry is a [`VeeInfo`]: a uid of its own plus a shared handle to the real
//! record, to which every read and write is delegated. The virtual uid is
//! the first 8 hex digits of the SHA-256 of the source folder id followed
//! by the real uid, so the same message always gets the same virtual uid.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::model::content_info::ContentInfo;
use crate::model::flags::MessageFlags;
use crate::model::message_id::MessageId;
use crate::model::message_info::{MessageInfoView, SharedMessageInfo};

use super::backend::SummaryBackend;
use super::changes::{ChangeListener, FolderChanges};
use super::folder::FolderSummary;
use super::locks::{read, write};

/// Length of the hash prefix of a virtual uid.
pub const VEE_HASH_LEN: usize = 8;

/// Hash prefix identifying `source_id`.
pub fn source_hash(source_id: &str) -> String {
    let digest = Sha256::digest(source_id.as_bytes());
    let mut hex = String::with_capacity(VEE_HASH_LEN);
    for byte in &digest[..VEE_HASH_LEN / 2] {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Virtual uid of `real_uid` from `source_id`.
pub fn vee_uid(source_id: &str, real_uid: &str) -> String {
    format!("{}{real_uid}", source_hash(source_id))
}

/// A virtual record.
#[derive(Clone)]
pub struct VeeInfo {
    uid: Arc<str>,
    source: Arc<dyn SharedMessageInfo>,
}

impl VeeInfo {
    pub fn new(source_id: &str, source: Arc<dyn SharedMessageInfo>) -> Self {
        let uid = vee_uid(source_id, &source.uid());
        Self {
            uid: Arc::from(uid),
            source,
        }
    }

    /// The real record.
    pub fn source(&self) -> &Arc<dyn SharedMessageInfo> {
        &self.source
    }

    /// Uid of the real record in its own folder.
    pub fn real_uid(&self) -> Arc<str> {
        self.source.uid()
    }
}

impl fmt::Debug for VeeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VeeInfo")
            .field("uid", &self.uid)
            .field("real_uid", &self.source.uid())
            .finish()
    }
}

impl MessageInfoView for VeeInfo {
    fn uid(&self) -> Arc<str> {
        Arc::clone(&self.uid)
    }
    fn size(&self) -> u32 {
        self.source.size()
    }
    fn flags(&self) -> MessageFlags {
        self.source.flags()
    }
    fn date_sent(&self) -> i64 {
        self.source.date_sent()
    }
    fn date_received(&self) -> i64 {
        self.source.date_received()
    }
    fn subject(&self) -> Arc<str> {
        self.source.subject()
    }
    fn from(&self) -> Arc<str> {
        self.source.from()
    }
    fn to(&self) -> Arc<str> {
        self.source.to()
    }
    fn cc(&self) -> Arc<str> {
        self.source.cc()
    }
    fn mlist(&self) -> Arc<str> {
        self.source.mlist()
    }
    fn message_id(&self) -> MessageId {
        self.source.message_id()
    }
    fn references(&self) -> Vec<MessageId> {
        self.source.references()
    }
    fn user_flag(&self, name: &str) -> bool {
        self.source.user_flag(name)
    }
    fn user_flags(&self) -> Vec<Arc<str>> {
        self.source.user_flags()
    }
    fn user_tag(&self, name: &str) -> Option<Arc<str>> {
        self.source.user_tag(name)
    }
    fn user_tags(&self) -> Vec<(Arc<str>, Arc<str>)> {
        self.source.user_tags()
    }
    fn content(&self) -> Option<Arc<ContentInfo>> {
        self.source.content()
    }
}

impl SharedMessageInfo for VeeInfo {
    fn set_flags(&self, mask: MessageFlags, set: MessageFlags) -> bool {
        self.source.set_flags(mask, set)
    }

    fn set_user_flag(&self, name: &str, value: bool) -> bool {
        self.source.set_user_flag(name, value)
    }

    fn set_user_tag(&self, name: &str, value: Option<&str>) -> bool {
        self.source.set_user_tag(name, value)
    }
}

struct VeeInner {
    name: Arc<str>,
    /// Entries in insertion order, with a uid -> position index.
    entries: RwLock<(Vec<VeeInfo>, HashMap<Arc<str>, usize>)>,
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
}

impl VeeInner {
    fn notify(&self, changes: FolderChanges) {
        if changes.is_empty() {
            return;
        }
        let listeners = read(&self.listeners).clone();
        for listener in listeners {
            listener.folder_changed(&self.name, &changes);
        }
    }

    /// Remove entries whose uid satisfies `matches`.
    fn remove_matching(&self, matches: impl Fn(&str) -> bool) -> Vec<Arc<str>> {
        let removed = {
            let mut guard = write(&self.entries);
            let (entries, index) = &mut *guard;
            let mut removed = Vec::new();
            entries.retain(|e| {
                if matches(&*e.uid) {
                    removed.push(Arc::clone(&e.uid));
                    false
                } else {
                    true
                }
            });
            if !removed.is_empty() {
                index.clear();
                for (pos, entry) in entries.iter().enumerate() {
                    index.insert(Arc::clone(&entry.uid), pos);
                }
            }
            removed
        };
        if !removed.is_empty() {
            self.notify(FolderChanges {
                removed: removed.clone(),
                ..FolderChanges::default()
            });
        }
        removed
    }
}

/// A virtual folder over records of other summaries.
#[derive(Clone)]
pub struct VeeSummary {
    inner: Arc<VeeInner>,
}

impl fmt::Debug for VeeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VeeSummary")
            .field("name", &self.inner.name)
            .field("count", &self.count())
            .finish()
    }
}

impl VeeSummary {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(VeeInner {
                name: Arc::from(name),
                entries: RwLock::new((Vec::new(), HashMap::new())),
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) {
        write(&self.inner.listeners).push(listener);
    }

    /// Add a record of folder `source_id`. Adding the same record twice
    /// returns the existing entry.
    pub fn add(&self, source_id: &str, source: Arc<dyn SharedMessageInfo>) -> VeeInfo {
        let info = VeeInfo::new(source_id, source);
        {
            let mut guard = write(&self.inner.entries);
            let (entries, index) = &mut *guard;
            if let Some(&pos) = index.get(&info.uid) {
                return entries[pos].clone();
            }
            index.insert(Arc::clone(&info.uid), entries.len());
            entries.push(info.clone());
        }
        self.inner.notify(FolderChanges {
            added: vec![Arc::clone(&info.uid)],
            ..FolderChanges::default()
        });
        info
    }

    /// Add every record of `summary` and follow it: records removed there
    /// disappear here, and changes to them are announced with their virtual
    /// uid.
    pub fn add_folder<B: SummaryBackend>(&self, summary: &FolderSummary<B>) -> usize {
        let source_id = summary.name().to_string();
        let mut added = 0;
        for info in summary.array() {
            self.add(&source_id, Arc::new(info));
            added += 1;
        }
        summary.subscribe(Arc::new(Follower {
            vee: Arc::downgrade(&self.inner),
            hash: source_hash(&source_id),
        }));
        debug!(vee = %self.name(), source = %source_id, added, "Following folder");
        added
    }

    pub fn count(&self) -> usize {
        read(&self.inner.entries).0.len()
    }

    pub fn uid(&self, uid: &str) -> Option<VeeInfo> {
        let guard = read(&self.inner.entries);
        let (entries, index) = &*guard;
        index.get(uid).map(|&pos| entries[pos].clone())
    }

    /// Entries in insertion order.
    pub fn array(&self) -> Vec<VeeInfo> {
        read(&self.inner.entries).0.clone()
    }

    pub fn uids(&self) -> Vec<Arc<str>> {
        read(&self.inner.entries)
            .0
            .iter()
            .map(|e| Arc::clone(&e.uid))
            .collect()
    }

    pub fn remove_uid(&self, uid: &str) -> bool {
        !self.inner.remove_matching(|u| u == uid).is_empty()
    }

    /// Remove every entry of folder `source_id`.
    pub fn remove_source(&self, source_id: &str) -> usize {
        let hash = source_hash(source_id);
        self.inner
            .remove_matching(|u| u.starts_with(hash.as_str()))
            .len()
    }
}

/// Forwards changes of a real folder to the virtual folder following it.
struct Follower {
    vee: Weak<VeeInner>,
    hash: String,
}

impl ChangeListener for Follower {
    fn folder_changed(&self, _folder: &str, changes: &FolderChanges) {
        let Some(vee) = self.vee.upgrade() else {
            return;
        };
        let to_vee = |uid: &Arc<str>| -> Arc<str> { Arc::from(format!("{}{uid}", self.hash)) };
        if !changes.removed.is_empty() {
            let gone: Vec<Arc<str>> = changes.removed.iter().map(to_vee).collect();
            vee.remove_matching(|u| gone.iter().any(|g| &**g == u));
        }
        if !changes.changed.is_empty() {
            let changed: Vec<Arc<str>> = {
                let guard = read(&vee.entries);
                changes
                    .changed
                    .iter()
                    .map(to_vee)
                    .filter(|uid| guard.1.contains_key(uid))
                    .collect()
            };
            vee.notify(FolderChanges {
                changed,
                ..FolderChanges::default()
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message_info::{MessageInfo, StandaloneInfo};
    use crate::summary::backend::DefaultBackend;
    use crate::summary::changes::testing::Recorder;
    use crate::summary::context::SummaryContext;
    use crate::summary::folder::SummaryOptions;

    fn standalone(uid: &str, subject: &str) -> Arc<dyn SharedMessageInfo> {
        Arc::new(StandaloneInfo::new(MessageInfo::<()> {
            uid: Arc::from(uid),
            subject: Arc::from(subject),
            ..MessageInfo::default()
        }))
    }

    #[test]
    fn test_vee_uid_is_stable() {
        let uid = vee_uid("inbox", "42");
        assert_eq!(uid.len(), VEE_HASH_LEN + 2);
        assert!(uid.ends_with("42"));
        assert_eq!(uid, vee_uid("inbox", "42"));
        assert_ne!(source_hash("inbox"), source_hash("archive"));
        assert!(source_hash("inbox").chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_reads_and_writes_go_to_the_real_record() {
        let vee = VeeSummary::new("unread");
        let real = standalone("7", "real subject");
        let info = vee.add("inbox", Arc::clone(&real));
        assert_eq!(info.uid().as_ref(), vee_uid("inbox", "7"));
        assert_eq!(&*info.real_uid(), "7");
        assert_eq!(&*info.subject(), "real subject");

        assert!(info.set_flags(MessageFlags::SEEN, MessageFlags::SEEN));
        assert!(real.flags().contains(MessageFlags::SEEN));
        assert!(info.set_user_tag("label", Some("blue")));
        assert_eq!(real.user_tag("label").as_deref(), Some("blue"));
    }

    #[test]
    fn test_add_is_idempotent_and_removal_by_source() {
        let vee = VeeSummary::new("all");
        vee.add("inbox", standalone("1", "a"));
        vee.add("inbox", standalone("1", "a"));
        vee.add("inbox", standalone("2", "b"));
        vee.add("archive", standalone("1", "c"));
        assert_eq!(vee.count(), 3);
        assert_eq!(vee.remove_source("inbox"), 2);
        assert_eq!(vee.count(), 1);
        assert_eq!(&*vee.array()[0].subject(), "c");
        assert!(vee.remove_uid(&vee_uid("archive", "1")));
        assert!(!vee.remove_uid(&vee_uid("archive", "1")));
    }

    #[test]
    fn test_follows_a_real_folder() {
        let dir = tempfile::tempdir().unwrap();
        let folder = FolderSummary::new(
            dir.path().join(".inbox.summary"),
            DefaultBackend,
            SummaryContext::shared(),
            SummaryOptions::default(),
        );
        folder.add(MessageInfo::default());
        folder.add(MessageInfo::default());

        let vee = VeeSummary::new("virtual");
        let recorder = Arc::new(Recorder::default());
        vee.subscribe(recorder.clone());
        assert_eq!(vee.add_folder(&folder), 2);

        let second = vee_uid("inbox", "2");
        vee.uid(&second)
            .unwrap()
            .set_flags(MessageFlags::FLAGGED, MessageFlags::FLAGGED);
        assert!(folder.uid("2").unwrap().flags().contains(MessageFlags::FLAGGED));

        folder.remove_uid("1");
        assert_eq!(vee.count(), 1);
        assert!(vee.uid(&vee_uid("inbox", "1")).is_none());

        let events = recorder.events.lock().unwrap();
        assert!(events
            .iter()
            .any(|(folder, c)| folder == "virtual" && c.changed == vec![Arc::<str>::from(second.as_str())]));
        assert!(events
            .iter()
            .any(|(_, c)| c.removed == vec![Arc::<str>::from(vee_uid("inbox", "1"))]));
    }
}

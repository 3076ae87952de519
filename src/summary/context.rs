//! State shared by every summary of one session: the string pool and the
//! message-id registry.
//!
//! Summaries receive an `Arc<SummaryContext>` when they are created; there
//! is no process-wide instance.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::model::message_id::MessageId;

use super::locks::lock;

/// Subject/sender text stored on expunged records.
pub const EXPUNGED_TEXT: &str = "Expunged";

/// Interned strings. Subjects, senders and mailing lists repeat across
/// thousands of records; each distinct value is stored once.
#[derive(Debug, Default)]
pub struct StringPool {
    strings: Mutex<HashSet<Arc<str>>>,
}

impl StringPool {
    /// Shared copy of `s`.
    pub fn intern(&self, s: &str) -> Arc<str> {
        let mut strings = lock(&self.strings);
        if let Some(existing) = strings.get(s) {
            return Arc::clone(existing);
        }
        let new: Arc<str> = Arc::from(s);
        strings.insert(Arc::clone(&new));
        new
    }

    /// Drop entries nobody but the pool refers to. Returns how many went.
    pub fn release_unused(&self) -> usize {
        let mut strings = lock(&self.strings);
        let before = strings.len();
        strings.retain(|s| Arc::strong_count(s) > 1);
        before - strings.len()
    }

    /// Number of distinct strings held.
    pub fn len(&self) -> usize {
        lock(&self.strings).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which folders hold a message with a given id.
#[derive(Debug, Default)]
pub struct MessageIdRegistry {
    owners: Mutex<HashMap<MessageId, Vec<(Arc<str>, Arc<str>)>>>,
}

impl MessageIdRegistry {
    /// Record that `folder` holds `id` under `uid`. Returns `true` if the id
    /// was already known (from any folder, or under another uid).
    pub fn register(&self, id: MessageId, folder: &Arc<str>, uid: &Arc<str>) -> bool {
        if id.is_empty() {
            return false;
        }
        let mut owners = lock(&self.owners);
        let entry = owners.entry(id).or_default();
        let duplicate = entry
            .iter()
            .any(|(f, u)| f.as_ref() != folder.as_ref() || u.as_ref() != uid.as_ref());
        if !entry
            .iter()
            .any(|(f, u)| f.as_ref() == folder.as_ref() && u.as_ref() == uid.as_ref())
        {
            entry.push((Arc::clone(folder), Arc::clone(uid)));
        }
        if duplicate {
            debug!(id = %id, folder = %folder, uid = %uid, "Duplicate message id");
        }
        duplicate
    }

    /// Forget that `folder` holds `id` under `uid`.
    pub fn unregister(&self, id: MessageId, folder: &str, uid: &str) {
        let mut owners = lock(&self.owners);
        if let Some(entry) = owners.get_mut(&id) {
            entry.retain(|(f, u)| f.as_ref() != folder || u.as_ref() != uid);
            if entry.is_empty() {
                owners.remove(&id);
            }
        }
    }

    /// Forget every id registered by `folder`.
    pub fn unregister_folder(&self, folder: &str) {
        let mut owners = lock(&self.owners);
        owners.retain(|_, entry| {
            entry.retain(|(f, _)| f.as_ref() != folder);
            !entry.is_empty()
        });
    }

    /// `(folder, uid)` pairs holding `id`.
    pub fn owners(&self, id: MessageId) -> Vec<(Arc<str>, Arc<str>)> {
        lock(&self.owners).get(&id).cloned().unwrap_or_default()
    }
}

/// Session-wide state handed to every summary.
#[derive(Debug, Default)]
pub struct SummaryContext {
    pub strings: StringPool,
    pub message_ids: MessageIdRegistry,
}

impl SummaryContext {
    /// A fresh context ready to share between summaries.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Intern `s` in the string pool.
    pub fn intern(&self, s: &str) -> Arc<str> {
        self.strings.intern(s)
    }

    /// The interned `"Expunged"` sentinel.
    pub fn expunged_text(&self) -> Arc<str> {
        self.strings.intern(EXPUNGED_TEXT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_shares_storage() {
        let pool = StringPool::default();
        let a = pool.intern("Weekly report");
        let b = pool.intern("Weekly report");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_release_unused() {
        let pool = StringPool::default();
        let kept = pool.intern("kept");
        drop(pool.intern("dropped"));
        assert_eq!(pool.release_unused(), 1);
        assert_eq!(pool.len(), 1);
        assert_eq!(&*kept, "kept");
    }

    #[test]
    fn test_registry_detects_duplicates_across_folders() {
        let registry = MessageIdRegistry::default();
        let id = MessageId::from_header("<dup@example.com>");
        let inbox: Arc<str> = Arc::from("inbox");
        let archive: Arc<str> = Arc::from("archive");
        let uid: Arc<str> = Arc::from("1");

        assert!(!registry.register(id, &inbox, &uid));
        assert!(!registry.register(id, &inbox, &uid));
        assert!(registry.register(id, &archive, &uid));
        assert_eq!(registry.owners(id).len(), 2);

        registry.unregister_folder("archive");
        assert_eq!(registry.owners(id).len(), 1);
        registry.unregister(id, "inbox", "1");
        assert!(registry.owners(id).is_empty());
    }

    #[test]
    fn test_empty_id_is_never_registered() {
        let registry = MessageIdRegistry::default();
        let f: Arc<str> = Arc::from("f");
        assert!(!registry.register(MessageId::default(), &f, &f));
        assert!(registry.owners(MessageId::default()).is_empty());
    }
}

//! Folder change notifications.

use std::sync::Arc;

/// What changed in a folder, by uid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderChanges {
    pub added: Vec<Arc<str>>,
    pub removed: Vec<Arc<str>>,
    pub changed: Vec<Arc<str>>,
}

impl FolderChanges {
    /// A change set reporting a single modified record.
    pub fn changed(uid: Arc<str>) -> Self {
        Self {
            changed: vec![uid],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Receives change sets. Called with no summary lock held.
pub trait ChangeListener: Send + Sync {
    fn folder_changed(&self, folder: &str, changes: &FolderChanges);
}

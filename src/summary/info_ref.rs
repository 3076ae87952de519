//! Handles to records owned by a summary.
//!
//! [`InfoHandle`] is a plain `Copy` key (slot index and generation). It does
//! not keep the record alive; resolving it after the record was freed
//! yields `None`. [`InfoRef`] is a counted reference: cloning it adds a
//! reference, dropping it releases one, and the record stays allocated
//! while any exist.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, Weak};

use crate::model::flags::MessageFlags;
use crate::model::message_info::{view_through_read, MessageInfo, SharedMessageInfo};

use super::backend::{DefaultBackend, SummaryBackend};
use super::folder::{FolderSummary, Inner};
use super::locks;

/// Arena key of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHandle {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

pub(crate) type Record<E> = Arc<RwLock<MessageInfo<E>>>;

/// Counted reference to a record owned by a summary.
///
/// Do not drop one while holding a summary lock: releasing takes the
/// summary and ref locks.
pub struct InfoRef<B: SummaryBackend = DefaultBackend> {
    summary: Weak<Inner<B>>,
    handle: InfoHandle,
    record: Record<B::Extra>,
}

impl<B: SummaryBackend> InfoRef<B> {
    /// Wrap a reference the caller has already counted.
    pub(crate) fn adopt(summary: Weak<Inner<B>>, handle: InfoHandle, record: Record<B::Extra>) -> Self {
        Self {
            summary,
            handle,
            record,
        }
    }

    pub fn handle(&self) -> InfoHandle {
        self.handle
    }

    /// Read-lock the record. Do not call summary methods while holding
    /// the guard.
    pub fn read(&self) -> RwLockReadGuard<'_, MessageInfo<B::Extra>> {
        locks::read(&self.record)
    }

    /// Copy of the record data.
    pub fn snapshot(&self) -> MessageInfo<B::Extra> {
        self.read().clone()
    }

    /// The owning summary, if it still exists.
    pub fn summary(&self) -> Option<FolderSummary<B>> {
        self.summary.upgrade().map(FolderSummary::from_inner)
    }

    /// Copy of the backend extension data.
    pub fn extra(&self) -> B::Extra {
        self.read().extra.clone()
    }

    /// Modify the backend extension data and mark the summary dirty.
    pub fn update_extra(&self, f: impl FnOnce(&mut B::Extra)) {
        f(&mut locks::write(&self.record).extra);
        if let Some(inner) = self.summary.upgrade() {
            inner.touch();
        }
    }

    /// The shared record, for backends that rewrite it during a sync.
    pub(crate) fn record(&self) -> &Record<B::Extra> {
        &self.record
    }

    /// Run `mutate` on the record; when it reports a change, mark the
    /// summary dirty and announce the uid.
    fn change(&self, mutate: impl FnOnce(&mut MessageInfo<B::Extra>, Option<&Inner<B>>) -> bool) -> bool {
        let inner = self.summary.upgrade();
        let uid = {
            let mut info = locks::write(&self.record);
            if !mutate(&mut info, inner.as_deref()) {
                return false;
            }
            Arc::clone(&info.uid)
        };
        if let Some(inner) = inner {
            inner.record_changed(uid);
        }
        true
    }
}

impl<B: SummaryBackend> Clone for InfoRef<B> {
    fn clone(&self) -> Self {
        if let Some(inner) = self.summary.upgrade() {
            inner.add_ref(self.handle);
        }
        Self {
            summary: Weak::clone(&self.summary),
            handle: self.handle,
            record: Arc::clone(&self.record),
        }
    }
}

impl<B: SummaryBackend> Drop for InfoRef<B> {
    fn drop(&mut self) {
        if let Some(inner) = self.summary.upgrade() {
            inner.release(self.handle);
        }
    }
}

impl<B: SummaryBackend> PartialEq for InfoRef<B> {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && Weak::ptr_eq(&self.summary, &other.summary)
    }
}

impl<B: SummaryBackend> fmt::Debug for InfoRef<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfoRef")
            .field("handle", &self.handle)
            .field("uid", &self.read().uid)
            .finish()
    }
}

impl<B: SummaryBackend> crate::model::message_info::MessageInfoView for InfoRef<B> {
    view_through_read!();
}

impl<B: SummaryBackend> SharedMessageInfo for InfoRef<B> {
    /// Visible changes mark the summary dirty and notify listeners; the
    /// backend's `flags_changed` hook runs first. Changes confined to the
    /// system bits are not announced but still mark the summary dirty, so
    /// they reach the next save. Returns whether anything changed.
    fn set_flags(&self, mask: MessageFlags, set: MessageFlags) -> bool {
        let inner = self.summary.upgrade();
        let (uid, visible) = {
            let mut info = locks::write(&self.record);
            let old = info.flags;
            if !info.set_flags(mask, set) {
                return false;
            }
            if let Some(inner) = inner.as_deref() {
                inner.backend().flags_changed(&mut info, old);
            }
            let visible = !(old ^ info.flags).visible().is_empty();
            (Arc::clone(&info.uid), visible)
        };
        if let Some(inner) = inner {
            if visible {
                inner.record_changed(uid);
            } else {
                inner.touch();
            }
        }
        true
    }

    fn set_user_flag(&self, name: &str, value: bool) -> bool {
        self.change(|info, inner| match inner {
            Some(inner) => info.set_user_flag_with(name, value, |s| inner.context().intern(s)),
            None => info.set_user_flag(name, value),
        })
    }

    fn set_user_tag(&self, name: &str, value: Option<&str>) -> bool {
        self.change(|info, inner| match inner {
            Some(inner) => info.set_user_tag_with(name, value, |s| inner.context().intern(s)),
            None => info.set_user_tag(name, value),
        })
    }
}

//! The folder summary engine.
//!
//! A [`FolderSummary`] owns the records of one folder, keeps them in folder
//! order, and persists them to a summary file. Records are stored in an
//! arena of slots; callers hold counted [`InfoRef`]s or plain
//! [`InfoHandle`]s. Membership in the summary counts as one reference, so a
//! removed record stays readable until the last outside reference goes.
//!
//! Locks, in acquisition order: `dump` (whole load/save, and the
//! structural part of add/remove), `io` (the file), `state` (slots and
//! order), `uid_index`, `refs`. A record's own lock may
//! be taken under any of them but never the other way round. Listeners are
//! called with no lock held.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use memmap2::Mmap;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, SummaryError};
use crate::model::flags::MessageFlags;
use crate::model::message_id::MessageId;
use crate::model::message_info::MessageInfo;
use crate::parser::header::RawHeaders;
use crate::parser::mime::MimeParser;

use super::backend::{DefaultBackend, SummaryBackend};
use super::changes::{ChangeListener, FolderChanges};
use super::codec::{DecodeError, Decoder};
use super::context::SummaryContext;
use super::format::{SummaryHeader, CURRENT_VERSION, FLAG_CONTENT};
use super::indexer::{BodyIndexer, IndexTarget};
use super::info_ref::{InfoHandle, InfoRef, Record};
use super::locks::{lock, read, write};
use super::record::{decode_record, encode_record};

/// Smallest possible encoded record, used to bound preallocation.
const MIN_RECORD_SIZE: usize = 64;

/// How a summary is built and stored.
#[derive(Clone)]
pub struct SummaryOptions {
    /// Build and store content trees.
    pub build_content: bool,
    /// Keep a uid -> record hash index.
    pub uid_index: bool,
    /// `fsync` the summary file before renaming it into place.
    pub fsync: bool,
    /// Receives body text while content trees are built.
    pub indexer: Option<Arc<dyn BodyIndexer>>,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            build_content: false,
            uid_index: true,
            fsync: true,
            indexer: None,
        }
    }
}

impl fmt::Debug for SummaryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SummaryOptions")
            .field("build_content", &self.build_content)
            .field("uid_index", &self.uid_index)
            .field("fsync", &self.fsync)
            .field("indexer", &self.indexer.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryPhase {
    /// Created, nothing loaded yet.
    Empty,
    Loading,
    Ready,
    Saving,
    /// Records were dropped by [`FolderSummary::unload`].
    Unloaded,
}

/// Result of [`FolderSummary::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { records: usize, version: u32 },
    /// There was no usable file; the summary starts empty.
    ColdStart,
}

/// Message counters computed from the live records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SummaryCounts {
    pub total: usize,
    pub unread: usize,
    pub deleted: usize,
    pub junk: usize,
    /// Neither deleted nor junk.
    pub visible: usize,
}

struct Slot<E> {
    generation: u32,
    record: Option<Record<E>>,
}

struct State<B: SummaryBackend> {
    slots: Vec<Slot<B::Extra>>,
    free: Vec<usize>,
    /// Records in folder order.
    live: Vec<InfoHandle>,
    /// Removed records flagged EXPUNGED, kept until `clear_expunged`.
    expunged: Vec<InfoHandle>,
    /// Last header read or written.
    header: SummaryHeader,
    backend_header: B::Header,
    phase: SummaryPhase,
}

impl<B: SummaryBackend> State<B> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: Vec::new(),
            expunged: Vec::new(),
            header: SummaryHeader::default(),
            backend_header: B::Header::default(),
            phase: SummaryPhase::Empty,
        }
    }

    fn record(&self, handle: InfoHandle) -> Option<&Record<B::Extra>> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    fn uid_at(&self, handle: InfoHandle) -> Option<Arc<str>> {
        self.record(handle).map(|r| Arc::clone(&read(r).uid))
    }

    fn find_uid(&self, uid: &str) -> Option<InfoHandle> {
        self.live
            .iter()
            .copied()
            .find(|h| self.record(*h).is_some_and(|r| &*read(r).uid == uid))
    }

    fn alloc(&mut self, refs: &mut Vec<u32>, record: Record<B::Extra>, count: u32) -> InfoHandle {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].record = Some(record);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    record: Some(record),
                });
                self.slots.len() - 1
            }
        };
        if refs.len() < self.slots.len() {
            refs.resize(self.slots.len(), 0);
        }
        refs[index] = count;
        InfoHandle {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Drop one reference. At zero the slot is freed and its record
    /// returned.
    fn unref(&mut self, refs: &mut [u32], handle: InfoHandle) -> Option<Record<B::Extra>> {
        self.record(handle)?;
        let count = refs.get_mut(handle.index)?;
        *count = count.saturating_sub(1);
        if *count > 0 {
            return None;
        }
        let slot = &mut self.slots[handle.index];
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        slot.record.take()
    }
}

/// A record taken out of the folder order.
struct Detached {
    uid: Arc<str>,
    message_id: MessageId,
}

struct Decoded<B: SummaryBackend> {
    header: SummaryHeader,
    backend_header: B::Header,
    records: Vec<MessageInfo<B::Extra>>,
}

pub(crate) struct Inner<B: SummaryBackend> {
    name: Arc<str>,
    path: PathBuf,
    backend: B,
    context: Arc<SummaryContext>,
    options: SummaryOptions,
    dump: Mutex<()>,
    io: Mutex<()>,
    state: RwLock<State<B>>,
    uid_index: RwLock<Option<HashMap<Arc<str>, InfoHandle>>>,
    refs: Mutex<Vec<u32>>,
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
    next_uid: AtomicU32,
    /// Bumped on every modification; the summary is dirty while it differs
    /// from `saved_changes`.
    changes: AtomicU64,
    saved_changes: AtomicU64,
}

impl<B: SummaryBackend> Inner<B> {
    pub(super) fn backend(&self) -> &B {
        &self.backend
    }

    pub(super) fn context(&self) -> &SummaryContext {
        &self.context
    }

    /// The caller already holds a reference, so the slot is alive.
    pub(super) fn add_ref(&self, handle: InfoHandle) {
        if let Some(count) = lock(&self.refs).get_mut(handle.index) {
            *count += 1;
        }
    }

    pub(super) fn release(&self, handle: InfoHandle) {
        let freed = {
            let mut st = write(&self.state);
            let mut refs = lock(&self.refs);
            st.unref(&mut refs, handle)
        };
        if freed.is_some() {
            trace!(folder = %self.name, slot = handle.index, "Freed record");
        }
    }

    pub(super) fn touch(&self) {
        self.changes.fetch_add(1, Ordering::SeqCst);
    }

    pub(super) fn record_changed(&self, uid: Arc<str>) {
        self.touch();
        self.notify(FolderChanges::changed(uid));
    }

    fn notify(&self, changes: FolderChanges) {
        if changes.is_empty() {
            return;
        }
        let listeners = read(&self.listeners).clone();
        for listener in listeners {
            listener.folder_changed(&self.name, &changes);
        }
    }

    fn mark_clean(&self) {
        self.saved_changes
            .store(self.changes.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    fn next_uid_string(&self) -> String {
        self.next_uid.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn bump_past(&self, uid: &str) {
        if let Ok(n) = uid.parse::<u32>() {
            self.next_uid.fetch_max(n.saturating_add(1), Ordering::SeqCst);
        }
    }

    fn uid_taken(
        &self,
        st: &State<B>,
        index: Option<&HashMap<Arc<str>, InfoHandle>>,
        uid: &str,
    ) -> bool {
        match index {
            Some(index) => index.contains_key(uid),
            None => st.find_uid(uid).is_some(),
        }
    }

    fn fresh_uid(&self, st: &State<B>, index: Option<&HashMap<Arc<str>, InfoHandle>>) -> Arc<str> {
        loop {
            let candidate = self.next_uid_string();
            if !self.uid_taken(st, index, &candidate) {
                return Arc::from(candidate);
            }
        }
    }

    /// Give `info` a uid that is unique in the folder. A colliding uid is
    /// replaced and the record flagged for its backend.
    fn assign_uid(
        &self,
        st: &State<B>,
        index: Option<&HashMap<Arc<str>, InfoHandle>>,
        info: &mut MessageInfo<B::Extra>,
    ) {
        if info.uid.is_empty() {
            info.uid = self.fresh_uid(st, index);
            return;
        }
        self.bump_past(&info.uid);
        if self.uid_taken(st, index, &info.uid) {
            let uid = self.fresh_uid(st, index);
            warn!(folder = %self.name, old = %info.uid, new = %uid, "Duplicate uid, reassigned");
            info.uid = uid;
            info.flags |= MessageFlags::FOLDER_FLAGGED;
        }
    }

    /// Take the record at `pos` out of the folder order. EXPUNGED records
    /// are scrubbed and parked; others lose their membership reference.
    fn detach(
        &self,
        st: &mut State<B>,
        index: &mut Option<HashMap<Arc<str>, InfoHandle>>,
        refs: &mut [u32],
        pos: usize,
    ) -> Option<Detached> {
        if pos >= st.live.len() {
            return None;
        }
        let handle = st.live.remove(pos);
        let record = Arc::clone(st.record(handle)?);
        let mut info = write(&record);
        let detached = Detached {
            uid: Arc::clone(&info.uid),
            message_id: info.message_id,
        };
        if let Some(index) = index.as_mut() {
            index.remove(&*detached.uid);
        }
        if info.flags.contains(MessageFlags::EXPUNGED) {
            scrub(&mut info, self.context.expunged_text());
            drop(info);
            st.expunged.push(handle);
        } else {
            drop(info);
            st.unref(refs, handle);
        }
        Some(detached)
    }

    fn finish_removal(&self, removed: Vec<Detached>) -> usize {
        if removed.is_empty() {
            return 0;
        }
        for d in &removed {
            self.context
                .message_ids
                .unregister(d.message_id, &self.name, &d.uid);
            if let Some(indexer) = &self.options.indexer {
                indexer.remove(&d.uid);
            }
        }
        let count = removed.len();
        debug!(folder = %self.name, count, "Removed records");
        self.touch();
        self.notify(FolderChanges {
            removed: removed.into_iter().map(|d| d.uid).collect(),
            ..FolderChanges::default()
        });
        count
    }
}

/// Replace the text of an expunged record with the sentinel and clear
/// everything else but its uid and size.
fn scrub<E>(info: &mut MessageInfo<E>, text: Arc<str>) {
    info.subject = Arc::clone(&text);
    info.from = Arc::clone(&text);
    info.to = Arc::clone(&text);
    info.cc = Arc::clone(&text);
    info.mlist = text;
    info.flags = MessageFlags::EXPUNGED;
    info.references.clear();
    info.user_flags.clear();
    info.user_tags.clear();
    info.content = None;
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("~");
    PathBuf::from(name)
}

/// `.inbox.summary` -> `inbox`.
fn folder_name(path: &Path) -> String {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let trimmed = file.trim_start_matches('.');
    let trimmed = trimmed.strip_suffix(".summary").unwrap_or(trimmed);
    if trimmed.is_empty() {
        file
    } else {
        trimmed.to_string()
    }
}

/// The summary of one folder.
pub struct FolderSummary<B: SummaryBackend = DefaultBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: SummaryBackend> Clone for FolderSummary<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: SummaryBackend> fmt::Debug for FolderSummary<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FolderSummary")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .field("backend", &self.inner.backend.name())
            .field("count", &self.count())
            .finish()
    }
}

impl<B: SummaryBackend> FolderSummary<B> {
    /// A summary stored at `path`, named after the file.
    pub fn new(
        path: impl Into<PathBuf>,
        backend: B,
        context: Arc<SummaryContext>,
        options: SummaryOptions,
    ) -> Self {
        let path = path.into();
        let name = folder_name(&path);
        Self::with_name(&name, path, backend, context, options)
    }

    pub fn with_name(
        name: &str,
        path: impl Into<PathBuf>,
        backend: B,
        context: Arc<SummaryContext>,
        options: SummaryOptions,
    ) -> Self {
        let uid_index = options.uid_index.then(HashMap::new);
        Self {
            inner: Arc::new(Inner {
                name: Arc::from(name),
                path: path.into(),
                backend,
                context,
                options,
                dump: Mutex::new(()),
                io: Mutex::new(()),
                state: RwLock::new(State::new()),
                uid_index: RwLock::new(uid_index),
                refs: Mutex::new(Vec::new()),
                listeners: RwLock::new(Vec::new()),
                next_uid: AtomicU32::new(1),
                changes: AtomicU64::new(0),
                saved_changes: AtomicU64::new(0),
            }),
        }
    }

    /// Create a summary and load its file.
    pub fn open(
        path: impl Into<PathBuf>,
        backend: B,
        context: Arc<SummaryContext>,
        options: SummaryOptions,
    ) -> Result<(Self, LoadOutcome)> {
        let summary = Self::new(path, backend, context, options);
        let outcome = summary.load()?;
        Ok((summary, outcome))
    }

    pub(crate) fn from_inner(inner: Arc<Inner<B>>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn context(&self) -> &Arc<SummaryContext> {
        &self.inner.context
    }

    pub fn options(&self) -> &SummaryOptions {
        &self.inner.options
    }

    pub fn phase(&self) -> SummaryPhase {
        read(&self.inner.state).phase
    }

    /// The header last read from or written to disk.
    pub fn header(&self) -> SummaryHeader {
        read(&self.inner.state).header
    }

    pub fn backend_header(&self) -> B::Header {
        read(&self.inner.state).backend_header.clone()
    }

    pub fn set_backend_header(&self, header: B::Header) {
        write(&self.inner.state).backend_header = header;
        self.inner.touch();
    }

    /// Record count of the file as last read or written.
    pub fn saved_count(&self) -> u32 {
        self.header().saved_count
    }

    /// Seconds since the epoch of the last successful save, 0 if never.
    pub fn last_save(&self) -> i64 {
        self.header().last_save
    }

    /// The uid the next new record would get.
    pub fn next_uid(&self) -> u32 {
        self.inner.next_uid.load(Ordering::SeqCst)
    }

    /// Reserve the next uid.
    pub fn next_uid_string(&self) -> String {
        self.inner.next_uid_string()
    }

    /// Make sure the uid counter is at least `uid`.
    pub fn set_uid(&self, uid: u32) {
        if self.inner.next_uid.fetch_max(uid, Ordering::SeqCst) < uid {
            self.inner.touch();
        }
    }

    /// Mark `uid` as modified and tell listeners.
    pub(crate) fn announce_changed(&self, uid: Arc<str>) {
        self.inner.record_changed(uid);
    }

    /// Mark the summary as needing a save.
    pub fn touch(&self) {
        self.inner.touch();
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.changes.load(Ordering::SeqCst) != self.inner.saved_changes.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) {
        write(&self.inner.listeners).push(listener);
    }

    /// Reserve a uid nobody in the folder uses.
    fn reserve_uid(&self) -> Arc<str> {
        let st = read(&self.inner.state);
        let index = read(&self.inner.uid_index);
        self.inner.fresh_uid(&st, index.as_ref())
    }

    pub fn info_new_from_header(&self, headers: &RawHeaders) -> MessageInfo<B::Extra> {
        MessageInfo::new_from_header(Some(&self.inner.context), headers)
    }

    /// Build a record for the message at the parser's position. With an
    /// indexer configured the uid is reserved first so body text is
    /// indexed under it.
    pub fn info_new_from_parser(&self, parser: &mut MimeParser<'_>) -> Option<MessageInfo<B::Extra>> {
        self.info_new_from_parser_as(parser, None)
    }

    /// [`FolderSummary::info_new_from_parser`] for a record that will carry
    /// `uid`, which is then used for indexing instead of a reserved one.
    pub(crate) fn info_new_from_parser_as(
        &self,
        parser: &mut MimeParser<'_>,
        uid: Option<Arc<str>>,
    ) -> Option<MessageInfo<B::Extra>> {
        let options = &self.inner.options;
        let indexer = options.indexer.as_deref().filter(|_| options.build_content);
        let uid = uid.or_else(|| indexer.map(|_| self.reserve_uid()));
        let target = match (indexer, &uid) {
            (Some(indexer), Some(uid)) => Some(IndexTarget { indexer, uid }),
            _ => None,
        };
        let mut info = MessageInfo::new_from_parser(
            Some(&self.inner.context),
            parser,
            options.build_content,
            target,
        )?;
        if let Some(uid) = uid {
            info.uid = uid;
        }
        Some(info)
    }

    pub fn info_new_from_message(&self, message: &mail_parser::Message<'_>) -> MessageInfo<B::Extra> {
        let options = &self.inner.options;
        let indexer = options.indexer.as_deref().filter(|_| options.build_content);
        let uid = indexer.map(|_| self.reserve_uid());
        let target = match (indexer, &uid) {
            (Some(indexer), Some(uid)) => Some(IndexTarget { indexer, uid }),
            _ => None,
        };
        let mut info = MessageInfo::new_from_message(
            Some(&self.inner.context),
            message,
            options.build_content,
            target,
        );
        if let Some(uid) = uid {
            info.uid = uid;
        }
        info
    }

    /// Append a record. An empty uid is filled from the counter; a uid
    /// already in use is replaced and the record gets FOLDER_FLAGGED.
    pub fn add(&self, mut info: MessageInfo<B::Extra>) -> InfoRef<B> {
        let inner = &self.inner;
        let (handle, record, uid, message_id) = {
            let _dump = lock(&inner.dump);
            let mut st = write(&inner.state);
            let mut index = write(&inner.uid_index);
            inner.assign_uid(&st, index.as_ref(), &mut info);
            let uid = Arc::clone(&info.uid);
            let message_id = info.message_id;
            let record = Arc::new(RwLock::new(info));
            let mut refs = lock(&inner.refs);
            let handle = st.alloc(&mut refs, Arc::clone(&record), 2);
            st.live.push(handle);
            if let Some(index) = index.as_mut() {
                index.insert(Arc::clone(&uid), handle);
            }
            if st.phase == SummaryPhase::Empty {
                st.phase = SummaryPhase::Ready;
            }
            (handle, record, uid, message_id)
        };
        inner
            .context
            .message_ids
            .register(message_id, &inner.name, &uid);
        trace!(folder = %inner.name, uid = %uid, "Added record");
        inner.touch();
        inner.notify(FolderChanges {
            added: vec![uid],
            ..FolderChanges::default()
        });
        InfoRef::adopt(Arc::downgrade(inner), handle, record)
    }

    pub fn add_from_header(&self, headers: &RawHeaders) -> InfoRef<B> {
        self.add(self.info_new_from_header(headers))
    }

    pub fn add_from_parser(&self, parser: &mut MimeParser<'_>) -> Option<InfoRef<B>> {
        let info = self.info_new_from_parser(parser)?;
        Some(self.add(info))
    }

    pub fn add_from_message(&self, message: &mail_parser::Message<'_>) -> InfoRef<B> {
        self.add(self.info_new_from_message(message))
    }

    fn make_ref(&self, st: &State<B>, handle: InfoHandle) -> Option<InfoRef<B>> {
        let record = Arc::clone(st.record(handle)?);
        if let Some(count) = lock(&self.inner.refs).get_mut(handle.index) {
            *count += 1;
        }
        Some(InfoRef::adopt(Arc::downgrade(&self.inner), handle, record))
    }

    /// Number of records in the folder.
    pub fn count(&self) -> usize {
        read(&self.inner.state).live.len()
    }

    /// Number of removed records still parked as expunged.
    pub fn expunged_count(&self) -> usize {
        read(&self.inner.state).expunged.len()
    }

    pub fn counts(&self) -> SummaryCounts {
        let st = read(&self.inner.state);
        let mut counts = SummaryCounts::default();
        for record in st.live.iter().filter_map(|h| st.record(*h)) {
            let flags = read(record).flags;
            counts.total += 1;
            if !flags.contains(MessageFlags::SEEN) {
                counts.unread += 1;
            }
            let deleted = flags.contains(MessageFlags::DELETED);
            let junk = flags.contains(MessageFlags::JUNK);
            if deleted {
                counts.deleted += 1;
            }
            if junk {
                counts.junk += 1;
            }
            if !deleted && !junk {
                counts.visible += 1;
            }
        }
        counts
    }

    /// Uids in folder order.
    pub fn uids(&self) -> Vec<Arc<str>> {
        let st = read(&self.inner.state);
        st.live.iter().filter_map(|h| st.uid_at(*h)).collect()
    }

    /// References to every record, in folder order.
    pub fn array(&self) -> Vec<InfoRef<B>> {
        let st = read(&self.inner.state);
        st.live.iter().filter_map(|h| self.make_ref(&st, *h)).collect()
    }

    /// References to the parked expunged records.
    pub fn expunged(&self) -> Vec<InfoRef<B>> {
        let st = read(&self.inner.state);
        st.expunged
            .iter()
            .filter_map(|h| self.make_ref(&st, *h))
            .collect()
    }

    /// The record at position `index` in folder order.
    pub fn index(&self, index: usize) -> Option<InfoRef<B>> {
        let st = read(&self.inner.state);
        let handle = *st.live.get(index)?;
        self.make_ref(&st, handle)
    }

    pub fn uid(&self, uid: &str) -> Option<InfoRef<B>> {
        let st = read(&self.inner.state);
        let handle = {
            let index = read(&self.inner.uid_index);
            match index.as_ref() {
                Some(index) => index.get(uid).copied(),
                None => st.find_uid(uid),
            }
        }?;
        self.make_ref(&st, handle)
    }

    /// Resolve a handle; `None` once its record has been freed.
    pub fn get(&self, handle: InfoHandle) -> Option<InfoRef<B>> {
        let st = read(&self.inner.state);
        self.make_ref(&st, handle)
    }

    pub fn has_uid_index(&self) -> bool {
        read(&self.inner.uid_index).is_some()
    }

    /// (Re)build the uid index from the live records.
    pub fn build_uid_index(&self) {
        let st = read(&self.inner.state);
        let map: HashMap<Arc<str>, InfoHandle> = st
            .live
            .iter()
            .filter_map(|h| st.uid_at(*h).map(|uid| (uid, *h)))
            .collect();
        *write(&self.inner.uid_index) = Some(map);
    }

    /// Drop the uid index; lookups fall back to a linear scan.
    pub fn drop_uid_index(&self) {
        *write(&self.inner.uid_index) = None;
    }

    /// Remove `info` from the folder. Returns `false` if it was not there.
    pub fn remove(&self, info: &InfoRef<B>) -> bool {
        let handle = info.handle();
        self.remove_where(|st, _| st.live.iter().position(|h| *h == handle))
    }

    pub fn remove_uid(&self, uid: &str) -> bool {
        self.remove_where(|st, index| {
            let handle = match index.as_ref() {
                Some(index) => index.get(uid).copied(),
                None => st.find_uid(uid),
            }?;
            st.live.iter().position(|h| *h == handle)
        })
    }

    pub fn remove_index(&self, index: usize) -> bool {
        self.remove_where(|_, _| Some(index))
    }

    fn remove_where(
        &self,
        find: impl FnOnce(&State<B>, &Option<HashMap<Arc<str>, InfoHandle>>) -> Option<usize>,
    ) -> bool {
        let inner = &self.inner;
        let detached = {
            let _dump = lock(&inner.dump);
            let mut st = write(&inner.state);
            let mut index = write(&inner.uid_index);
            let Some(pos) = find(&*st, &*index) else {
                return false;
            };
            let mut refs = lock(&inner.refs);
            inner.detach(&mut st, &mut index, &mut refs, pos)
        };
        inner.finish_removal(detached.into_iter().collect()) > 0
    }

    /// Remove the records at positions `range`, clamped to the folder.
    /// Returns how many went.
    pub fn remove_range(&self, range: Range<usize>) -> usize {
        let inner = &self.inner;
        let mut removed = {
            let _dump = lock(&inner.dump);
            let mut st = write(&inner.state);
            let mut index = write(&inner.uid_index);
            let mut refs = lock(&inner.refs);
            let end = range.end.min(st.live.len());
            let start = range.start.min(end);
            (start..end)
                .rev()
                .filter_map(|pos| inner.detach(&mut st, &mut index, &mut refs, pos))
                .collect::<Vec<_>>()
        };
        removed.reverse();
        inner.finish_removal(removed)
    }

    /// Remove every record.
    pub fn clear(&self) -> usize {
        self.remove_range(0..usize::MAX)
    }

    /// Release the parked expunged records.
    pub fn clear_expunged(&self) -> usize {
        let count = {
            let _dump = lock(&self.inner.dump);
            let mut st = write(&self.inner.state);
            let mut refs = lock(&self.inner.refs);
            let parked = std::mem::take(&mut st.expunged);
            for handle in &parked {
                st.unref(&mut refs, *handle);
            }
            parked.len()
        };
        if count > 0 {
            self.inner.context.strings.release_unused();
        }
        count
    }

    /// Drop all records from memory without touching the file. Unsaved
    /// changes are lost.
    pub fn unload(&self) {
        let inner = &self.inner;
        let _dump = lock(&inner.dump);
        {
            let mut st = write(&inner.state);
            let mut index = write(&inner.uid_index);
            let mut refs = lock(&inner.refs);
            let mut handles = std::mem::take(&mut st.live);
            handles.append(&mut st.expunged);
            for handle in handles {
                st.unref(&mut refs, handle);
            }
            if let Some(index) = index.as_mut() {
                index.clear();
            }
            st.phase = SummaryPhase::Unloaded;
        }
        inner.context.message_ids.unregister_folder(&inner.name);
        inner.context.strings.release_unused();
        inner.mark_clean();
        debug!(folder = %inner.name, "Unloaded summary");
    }

    /// Read the summary file and reconcile it with the records in memory.
    ///
    /// The file is decoded completely before anything changes, so a
    /// corrupt file leaves the summary as it was. Records present in
    /// memory are refreshed in place and keep their handles; in-memory
    /// records beyond the file's count are expunged. A missing or
    /// unmappable file is a cold start.
    pub fn load(&self) -> Result<LoadOutcome> {
        let inner = &self.inner;
        let _dump = lock(&inner.dump);
        let previous = std::mem::replace(&mut write(&inner.state).phase, SummaryPhase::Loading);

        let decoded = match self.read_file(true) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                write(&inner.state).phase = SummaryPhase::Ready;
                info!(folder = %inner.name, path = %inner.path.display(), "No summary file, starting empty");
                return Ok(LoadOutcome::ColdStart);
            }
            Err(e) => {
                write(&inner.state).phase = previous;
                warn!(folder = %inner.name, error = %e, "Summary load failed");
                return Err(e);
            }
        };

        let header = decoded.header;
        let records = decoded.records.len();
        let renamed = self.apply(decoded);
        if header.is_legacy() || renamed > 0 {
            inner.touch();
        } else {
            inner.mark_clean();
        }
        info!(
            folder = %inner.name,
            records,
            version = header.version,
            renamed,
            "Loaded summary"
        );
        Ok(LoadOutcome::Loaded {
            records,
            version: header.version,
        })
    }

    /// Read only the header and backend header. Returns `None` when there
    /// is no usable file.
    pub fn load_header(&self) -> Result<Option<SummaryHeader>> {
        let inner = &self.inner;
        let _dump = lock(&inner.dump);
        let Some(decoded) = self.read_file(false)? else {
            return Ok(None);
        };
        inner
            .next_uid
            .fetch_max(decoded.header.next_uid, Ordering::SeqCst);
        let mut st = write(&inner.state);
        st.header = decoded.header;
        st.backend_header = decoded.backend_header;
        Ok(Some(decoded.header))
    }

    fn read_file(&self, with_records: bool) -> Result<Option<Decoded<B>>> {
        let inner = &self.inner;
        let path = &inner.path;
        let _io = lock(&inner.io);

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SummaryError::io(path, e)),
        };
        let len = file.metadata().map_err(|e| SummaryError::io(path, e))?.len();
        if len == 0 {
            return Ok(None);
        }
        // SAFETY: the map is read-only and dropped before returning.
        // Summary files are replaced by rename, never rewritten in place.
        let map = match unsafe { Mmap::map(&file) } {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot map summary file");
                return Ok(None);
            }
        };

        let corrupt = |e: DecodeError| SummaryError::corrupt(path, e);
        let mut dec = Decoder::new(&map);
        let header = SummaryHeader::decode(&mut dec).map_err(corrupt)?;
        let backend_header = inner.backend.header_load(&mut dec).map_err(corrupt)?;

        let mut records = Vec::new();
        if with_records {
            records.reserve((header.saved_count as usize).min(dec.remaining() / MIN_RECORD_SIZE));
            for _ in 0..header.saved_count {
                let info = decode_record(&inner.backend, &mut dec, header.has_content(), &inner.context)
                    .map_err(corrupt)?;
                records.push(info);
            }
            if !dec.is_at_end() {
                debug!(path = %path.display(), trailing = dec.remaining(), "Ignoring trailing bytes");
            }
        }
        Ok(Some(Decoded {
            header,
            backend_header,
            records,
        }))
    }

    /// Install decoded records. Returns how many duplicate uids were
    /// reassigned.
    fn apply(&self, decoded: Decoded<B>) -> usize {
        let inner = &self.inner;
        let Decoded {
            header,
            backend_header,
            records,
        } = decoded;
        let loaded = records.len();
        let expunged_text = inner.context.expunged_text();
        let mut unregister: Vec<(MessageId, Arc<str>)> = Vec::new();
        let mut register: Vec<(MessageId, Arc<str>)> = Vec::with_capacity(loaded);
        let mut renamed = 0;

        {
            let mut st = write(&inner.state);
            let mut index = write(&inner.uid_index);
            let mut refs = lock(&inner.refs);

            while st.live.len() > loaded {
                let Some(handle) = st.live.pop() else {
                    break;
                };
                if let Some(record) = st.record(handle).cloned() {
                    let mut info = write(&record);
                    unregister.push((info.message_id, Arc::clone(&info.uid)));
                    scrub(&mut info, Arc::clone(&expunged_text));
                    drop(info);
                    st.expunged.push(handle);
                }
            }

            inner.next_uid.fetch_max(header.next_uid, Ordering::SeqCst);
            let mut taken: HashSet<Arc<str>> = HashSet::with_capacity(loaded);
            for info in &records {
                inner.bump_past(&info.uid);
                taken.insert(Arc::clone(&info.uid));
            }

            let mut seen: HashSet<Arc<str>> = HashSet::with_capacity(loaded);
            for (pos, mut info) in records.into_iter().enumerate() {
                if info.uid.is_empty() || !seen.insert(Arc::clone(&info.uid)) {
                    let uid: Arc<str> = loop {
                        let candidate: Arc<str> = Arc::from(inner.next_uid_string());
                        if taken.insert(Arc::clone(&candidate)) {
                            break candidate;
                        }
                    };
                    warn!(folder = %inner.name, old = %info.uid, new = %uid, "Duplicate uid in summary, reassigned");
                    seen.insert(Arc::clone(&uid));
                    info.uid = uid;
                    info.flags |= MessageFlags::FOLDER_FLAGGED;
                    renamed += 1;
                }
                register.push((info.message_id, Arc::clone(&info.uid)));

                match st.live.get(pos).copied() {
                    Some(handle) => {
                        if let Some(record) = st.record(handle) {
                            let mut slot = write(record);
                            unregister.push((slot.message_id, Arc::clone(&slot.uid)));
                            *slot = info;
                        }
                    }
                    None => {
                        let handle = st.alloc(&mut refs, Arc::new(RwLock::new(info)), 1);
                        st.live.push(handle);
                    }
                }
            }

            if let Some(index) = index.as_mut() {
                index.clear();
                for handle in &st.live {
                    if let Some(uid) = st.uid_at(*handle) {
                        index.insert(uid, *handle);
                    }
                }
            }
            st.header = header;
            st.backend_header = backend_header;
            st.phase = SummaryPhase::Ready;
        }

        let ids = &inner.context.message_ids;
        for (id, uid) in unregister {
            ids.unregister(id, &inner.name, &uid);
        }
        for (id, uid) in register {
            ids.register(id, &inner.name, &uid);
        }
        renamed
    }

    /// Write the summary if it has unsaved changes. Returns whether a file
    /// was written.
    ///
    /// The file is written next to its destination as `<path>~`, synced
    /// when configured, renamed into place and read back to check the
    /// header. On failure the temporary file is removed and the summary
    /// stays dirty.
    pub fn save(&self) -> Result<bool> {
        let inner = &self.inner;
        let _dump = lock(&inner.dump);
        let changes = inner.changes.load(Ordering::SeqCst);
        if changes == inner.saved_changes.load(Ordering::SeqCst) {
            trace!(folder = %inner.name, "Summary clean, not saving");
            return Ok(false);
        }

        let (records, backend_header, previous) = {
            let mut st = write(&inner.state);
            let previous = std::mem::replace(&mut st.phase, SummaryPhase::Saving);
            let records: Vec<Record<B::Extra>> =
                st.live.iter().filter_map(|h| st.record(*h).cloned()).collect();
            (records, st.backend_header.clone(), previous)
        };

        let header = SummaryHeader {
            version: CURRENT_VERSION,
            flags: if inner.options.build_content { FLAG_CONTENT } else { 0 },
            next_uid: inner.next_uid.load(Ordering::SeqCst),
            last_save: Utc::now().timestamp(),
            saved_count: u32::try_from(records.len()).unwrap_or(u32::MAX),
            legacy_counts: None,
        };

        let result = {
            let _io = lock(&inner.io);
            self.write_file(&header, &backend_header, &records)
        };

        let mut st = write(&inner.state);
        match result {
            Ok(()) => {
                st.header = header;
                st.phase = SummaryPhase::Ready;
                drop(st);
                inner.saved_changes.store(changes, Ordering::SeqCst);
                info!(folder = %inner.name, records = records.len(), "Saved summary");
                Ok(true)
            }
            Err(e) => {
                st.phase = previous;
                warn!(folder = %inner.name, error = %e, "Summary save failed");
                Err(e)
            }
        }
    }

    fn write_file(
        &self,
        header: &SummaryHeader,
        backend_header: &B::Header,
        records: &[Record<B::Extra>],
    ) -> Result<()> {
        let path = &self.inner.path;
        let tmp = temp_path(path);
        let result = self
            .write_temp(&tmp, header, backend_header, records)
            .and_then(|()| fs::rename(&tmp, path).map_err(|e| SummaryError::io(path, e)))
            .and_then(|()| self.verify(header));
        if result.is_err() {
            if let Err(e) = fs::remove_file(&tmp) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %tmp.display(), error = %e, "Cannot remove temporary summary");
                }
            }
        }
        result
    }

    fn write_temp(
        &self,
        tmp: &Path,
        header: &SummaryHeader,
        backend_header: &B::Header,
        records: &[Record<B::Extra>],
    ) -> Result<()> {
        let inner = &self.inner;
        if let Some(parent) = tmp.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| SummaryError::io(parent, e))?;
        }
        let file = File::create(tmp).map_err(|e| SummaryError::io(tmp, e))?;
        let mut w = BufWriter::new(file);
        encode_all(&inner.backend, &mut w, header, backend_header, records)
            .map_err(|e| SummaryError::io(tmp, e))?;
        let file = w
            .into_inner()
            .map_err(|e| SummaryError::io(tmp, e.into_error()))?;
        if inner.options.fsync {
            file.sync_all().map_err(|e| SummaryError::io(tmp, e))?;
        }
        Ok(())
    }

    fn verify(&self, expected: &SummaryHeader) -> Result<()> {
        let path = &self.inner.path;
        let file = File::open(path).map_err(|e| SummaryError::io(path, e))?;
        // SAFETY: read-only map of a file we just renamed into place, dropped
        // before returning.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| SummaryError::io(path, e))?;
        let header = SummaryHeader::decode(&mut Decoder::new(&map))
            .map_err(|e| SummaryError::corrupt(path, e))?;
        if header != *expected {
            return Err(SummaryError::VerifyFailed(path.clone()));
        }
        Ok(())
    }
}

fn encode_all<B: SummaryBackend>(
    backend: &B,
    w: &mut dyn Write,
    header: &SummaryHeader,
    backend_header: &B::Header,
    records: &[Record<B::Extra>],
) -> io::Result<()> {
    let with_content = header.has_content();
    header.encode(w)?;
    backend.header_save(backend_header, w)?;
    for record in records {
        encode_record(backend, &read(record), with_content, w)?;
    }
    w.flush()
}

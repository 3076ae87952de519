//! Folder summaries: persisted per-folder message indexes.
//!
//! A [`FolderSummary`] keeps the metadata of every message of one folder in
//! memory and saves it to a compact binary file next to the folder. The
//! file layout lives in [`format`] and [`record`]; [`codec`] and [`tokens`]
//! hold the primitive encodings. Backends plug their own header and
//! per-record data in through [`SummaryBackend`].

pub mod backend;
pub mod changes;
pub mod codec;
pub mod context;
pub mod folder;
pub mod format;
pub mod imap;
pub mod indexer;
pub mod info_ref;
pub mod locks;
pub mod mbox;
pub mod record;
pub mod tokens;
pub mod vee;

pub use backend::{DefaultBackend, SummaryBackend};
pub use changes::{ChangeListener, FolderChanges};
pub use context::SummaryContext;
pub use folder::{FolderSummary, LoadOutcome, SummaryCounts, SummaryOptions, SummaryPhase};
pub use imap::{ImapBackend, ImapExtra, ImapHeader, ImapSummary};
pub use indexer::{BodyIndexer, WordIndex};
pub use info_ref::{InfoHandle, InfoRef};
pub use mbox::{MboxBackend, MboxExtra, MboxHeader, MboxInfo, MboxSummary, SyncReport};
pub use vee::{VeeInfo, VeeSummary};

//! `mailsummary`: persistent folder summaries for mail stores.
//!
//! A folder summary is a compact binary index of the metadata of every
//! message in a folder: envelope strings, flags, message-id hashes for
//! threading, user flags and tags, and optionally the MIME structure. It is
//! loaded from a memory-mapped file, kept consistent with the mail store
//! while the folder is open, and rewritten atomically on save.
//!
//! The engine lives in [`summary`]; [`store`] couples it to mbox files.

pub mod config;
pub mod error;
pub mod model;
pub mod parser;
pub mod store;
pub mod summary;

pub use error::{Result, SummaryError};

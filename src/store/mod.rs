//! Mail stores backed by a folder summary.

pub mod mbox;

pub use mbox::{ExpungeReport, MboxFolder};

//! Body text indexing hook.
//!
//! When a summary is configured with an indexer, text parts seen while
//! building content trees are handed to it keyed by the message uid.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use super::locks::lock;

/// Receives decoded body text of newly summarised messages.
pub trait BodyIndexer: Send + Sync {
    /// Add `text` to the entry for `uid`.
    fn add_text(&self, uid: &str, text: &str);

    /// Forget everything indexed for `uid`.
    fn remove(&self, uid: &str);
}

/// Indexer plus the uid the text belongs to.
#[derive(Clone, Copy)]
pub struct IndexTarget<'a> {
    pub indexer: &'a dyn BodyIndexer,
    pub uid: &'a str,
}

/// Words shorter than this are not indexed.
const MIN_WORD_LEN: usize = 3;

/// A small in-memory inverted index: lower-cased word -> uids.
#[derive(Debug, Default)]
pub struct WordIndex {
    words: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl WordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uids whose text contains `word` (case-insensitive), sorted.
    pub fn search(&self, word: &str) -> Vec<String> {
        let word = word.to_lowercase();
        lock(&self.words)
            .get(&word)
            .map(|uids| uids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of distinct words.
    pub fn word_count(&self) -> usize {
        lock(&self.words).len()
    }
}

impl BodyIndexer for WordIndex {
    fn add_text(&self, uid: &str, text: &str) {
        let mut words = lock(&self.words);
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() >= MIN_WORD_LEN)
        {
            words
                .entry(word.to_lowercase())
                .or_default()
                .insert(uid.to_string());
        }
    }

    fn remove(&self, uid: &str) {
        let mut words = lock(&self.words);
        words.retain(|_, uids| {
            uids.remove(uid);
            !uids.is_empty()
        });
    }
}

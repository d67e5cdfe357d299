//! Write buffer — the in-memory ordered map of pending updates.
//!
//! ## Design invariants
//!
//! - Entries are keyed by byte key; iteration order is unsigned
//!   lexicographic.
//! - Resolution happens at insertion time: the buffer holds at most one
//!   entry per key, already combined per the entry-resolution rules.
//! - Blobs are still raw bytes here (`Entry<Vec<u8>>`); they only become
//!   [`BlobSpan`](crate::entry::BlobSpan) references when the buffer is
//!   flushed into a run.
//!
//! The buffer itself is not synchronized — the owning table's state cell
//! guards all access.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use crate::entry::{Entry, Key, Resolve, combine, outcome_at_level};

/// An entry whose blob payload (if any) is still raw bytes.
pub type RawEntry = Entry<Vec<u8>>;

/// In-memory sorted map of pending updates, resolution applied on insert.
#[derive(Debug, Clone, Default)]
pub struct WriteBuffer {
    map: BTreeMap<Key, RawEntry>,
}

impl WriteBuffer {
    /// Creates an empty write buffer.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a buffer directly from an already-resolved map.
    pub fn from_map(map: BTreeMap<Key, RawEntry>) -> Self {
        Self { map }
    }

    /// Consumes the buffer, returning the underlying map.
    pub fn into_map(self) -> BTreeMap<Key, RawEntry> {
        self.map
    }

    /// Number of distinct keys held.
    pub fn num_entries(&self) -> usize {
        self.map.len()
    }

    /// True when no entries are held.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Inserts an update, resolving against any existing entry for the
    /// same key. The incoming entry is the newer of the two.
    pub fn insert(&mut self, key: Key, entry: RawEntry, resolve: &Resolve) {
        match self.map.remove(&key) {
            None => {
                self.map.insert(key, entry);
            }
            Some(older) => {
                self.map.insert(key, combine(resolve, entry, older));
            }
        }
    }

    /// Looks up the resolved entry for a key.
    pub fn get(&self, key: &[u8]) -> Option<&RawEntry> {
        self.map.get(key)
    }

    /// Key/entry pairs in ascending key order.
    pub fn to_list(&self) -> Vec<(Key, RawEntry)> {
        self.map.iter().map(|(k, e)| (k.clone(), e.clone())).collect()
    }

    /// Borrowing iterator in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &RawEntry)> {
        self.map.iter()
    }

    /// Entries within `lo..hi` in ascending key order. An inverted range
    /// is empty.
    pub fn range(&self, lo: &[u8], hi: &[u8]) -> impl Iterator<Item = (&Key, &RawEntry)> {
        let hi = if lo <= hi { hi } else { lo };
        self.map.range(lo.to_vec()..hi.to_vec())
    }

    /// Unions `self` (newer) with `other` (older), resolving key
    /// collisions with the supplied function.
    pub fn union(self, other: WriteBuffer, resolve: &Resolve) -> WriteBuffer {
        let mut out = other.map;
        for (key, newer) in self.map {
            match out.remove(&key) {
                None => {
                    out.insert(key, newer);
                }
                Some(older) => {
                    out.insert(key, combine(resolve, newer, older));
                }
            }
        }
        WriteBuffer { map: out }
    }

    /// N-way merge of buffers, earliest-listed newest, applying the
    /// destination-level outcome policy.
    ///
    /// This is the in-memory mirror of merging the buffers' flushed runs:
    /// both paths fold per-key entries newest-first with `combine` and
    /// then apply the same level policy, so flushing the merged buffer
    /// produces byte-identical run files to merging the individual
    /// flushes.
    pub fn merge(is_last_level: bool, buffers: Vec<WriteBuffer>, resolve: &Resolve) -> WriteBuffer {
        let mut out: BTreeMap<Key, RawEntry> = BTreeMap::new();
        // Fold oldest buffer first so that each newer buffer's entry is
        // the `newer` argument of `combine`.
        for buffer in buffers.into_iter().rev() {
            for (key, newer) in buffer.map {
                match out.remove(&key) {
                    None => {
                        out.insert(key, newer);
                    }
                    Some(older) => {
                        out.insert(key, combine(resolve, newer, older));
                    }
                }
            }
        }
        let map = out
            .into_iter()
            .filter_map(|(k, e)| outcome_at_level(is_last_level, e).map(|e| (k, e)))
            .collect();
        WriteBuffer { map }
    }
}

impl<'a> IntoIterator for &'a WriteBuffer {
    type Item = (&'a Key, &'a RawEntry);
    type IntoIter = std::collections::btree_map::Iter<'a, Key, RawEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.iter()
    }
}

//! Shared entry types — the currency every layer trades in.
//!
//! This module defines:
//!
//! - [`Entry`] — the unified representation of an insert, blob-carrying
//!   insert, monoidal upsert, or delete, used across the write buffer,
//!   runs, merges, and lookups.
//! - [`BlobSpan`] — an `(offset, length)` reference into a run's blob file.
//! - [`combine`] — the resolution of two entries for the same key.
//!
//! `Entry` is generic over its blob representation `B`: in the write
//! buffer a blob is still raw bytes (`Entry<Vec<u8>>`); once flushed into
//! a run it is a [`BlobSpan`] pointing into the run's blob file
//! (`Entry<BlobSpan>`).

use std::sync::Arc;

/// An opaque key. Ordering is unsigned lexicographic on the bytes.
pub type Key = Vec<u8>;

/// An opaque value.
pub type Value = Vec<u8>;

/// The monoidal combine `⊕` on values, supplied by the host.
///
/// Must be associative: `resolve(a, resolve(b, c)) == resolve(resolve(a, b), c)`.
/// The first argument is the newer value.
pub type Resolve = Arc<dyn Fn(&[u8], &[u8]) -> Vec<u8> + Send + Sync>;

/// A reference to an out-of-line byte sequence in a run's blob file.
///
/// Blobs are immutable; a span stays valid for the lifetime of the run
/// that owns the blob file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobSpan {
    /// Byte offset into the blob file.
    pub offset: u64,

    /// Length of the blob in bytes.
    pub length: u32,
}

/// A single update for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry<B = BlobSpan> {
    /// Store the value, replacing any older entry.
    Insert(Value),

    /// Store the value together with an out-of-line blob.
    InsertWithBlob(Value, B),

    /// Monoidal upsert: combine the value with the older entry's value
    /// via the host-supplied `⊕`.
    Mupdate(Value),

    /// Remove the key.
    Delete,
}

impl<B> Entry<B> {
    /// Operation code stored in the page crumbmap.
    ///
    /// `0` = insert (with or without blob), `1` = mupdate, `2` = delete,
    /// `3` reserved.
    pub fn op_code(&self) -> u8 {
        match self {
            Entry::Insert(_) | Entry::InsertWithBlob(_, _) => 0,
            Entry::Mupdate(_) => 1,
            Entry::Delete => 2,
        }
    }

    /// The inline value bytes. Deletes carry an empty value.
    pub fn value(&self) -> &[u8] {
        match self {
            Entry::Insert(v) | Entry::InsertWithBlob(v, _) | Entry::Mupdate(v) => v,
            Entry::Delete => &[],
        }
    }

    /// The blob reference, if this entry carries one.
    pub fn blob(&self) -> Option<&B> {
        match self {
            Entry::InsertWithBlob(_, b) => Some(b),
            _ => None,
        }
    }

    /// Rewrite the blob representation, leaving everything else intact.
    ///
    /// Used when flushing (raw blob bytes become spans) and when merging
    /// (spans into an input's blob file become spans into the output's).
    pub fn map_blob<C>(self, f: impl FnOnce(B) -> C) -> Entry<C> {
        match self {
            Entry::Insert(v) => Entry::Insert(v),
            Entry::InsertWithBlob(v, b) => Entry::InsertWithBlob(v, f(b)),
            Entry::Mupdate(v) => Entry::Mupdate(v),
            Entry::Delete => Entry::Delete,
        }
    }
}

/// Resolve two entries for the same key; `newer` overrides `older`.
///
/// - `Delete` and `Insert`/`InsertWithBlob` absorb any older entry.
/// - `Mupdate(v)` over `Insert(u)` → `Insert(v ⊕ u)`. The older entry's
///   blob (if any) does not survive resolution.
/// - `Mupdate(v)` over `Mupdate(u)` → `Mupdate(v ⊕ u)`.
/// - `Mupdate(v)` over `Delete` → `Insert(v)`.
pub fn combine<B>(resolve: &Resolve, newer: Entry<B>, older: Entry<B>) -> Entry<B> {
    match newer {
        Entry::Mupdate(v) => match older {
            Entry::Insert(u) | Entry::InsertWithBlob(u, _) => Entry::Insert(resolve(&v, &u)),
            Entry::Mupdate(u) => Entry::Mupdate(resolve(&v, &u)),
            Entry::Delete => Entry::Insert(v),
        },
        absorbing => absorbing,
    }
}

/// Post-resolution policy applied when an entry reaches its destination
/// level.
///
/// At the last level a `Delete` is elided (no tombstone persists) and a
/// `Mupdate` becomes an `Insert` — there is nothing below for it to
/// combine with. Mid-level entries pass through unchanged.
pub fn outcome_at_level<B>(is_last_level: bool, entry: Entry<B>) -> Option<Entry<B>> {
    if !is_last_level {
        return Some(entry);
    }
    match entry {
        Entry::Delete => None,
        Entry::Mupdate(v) => Some(Entry::Insert(v)),
        other => Some(other),
    }
}

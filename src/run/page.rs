//! Disk page accumulation and serialization.
//!
//! A run's k/ops file is a concatenation of 4096-byte pages. Each page
//! packs a directory, two bit-packed per-entry maps, a blob-span array,
//! key/value offset arrays, and the concatenated key and value bytes:
//!
//! ```text
//! (1) directory: num_elems:u16, num_blobs:u16, key_offsets_offset:u16, 0:u16
//! (2) blob-present bitmap: ceil(num_elems/64) × u64
//! (3) operation crumbmap (2 bits per entry): ceil(num_elems/32) × u64
//! (4) blob span array: num_blobs × (offset:u64, size:u32)
//! (5) key-offset array: num_elems × u16
//! (6) value-offset array:
//!        num_elems == 1: (start:u16, end:u32)   -- permits large values
//!        otherwise:      (num_elems+1) × u16
//! (7) concatenated key bytes
//! (8) concatenated value bytes
//! (9) zero padding to 4096 bytes
//! ```
//!
//! All integers are little-endian. Offsets are absolute within the page.
//! Key `i` spans `[koff[i], koff[i+1])`, the last key ending at the first
//! value offset. A page normally holds as many entries as fit in 4096
//! bytes; a single entry whose value overflows is emitted alone as a
//! multi-page byte string padded to the next 4 KiB multiple, with the
//! `(u16, u32)` value-offset form addressing past the first page.

use crate::entry::{BlobSpan, Entry, Key};
use crate::error::StoreError;

/// Size of one disk page (and the unit the k/ops file is addressed in).
pub const PAGE_SIZE: usize = 4096;

/// Directory size at the head of every page.
const DIR_SIZE: usize = 8;

/// Maximum serialized key length.
///
/// Key bytes must end within the `u16` offset range even in the
/// single-entry page form, whose fixed prelude is at most 44 bytes.
pub const MAX_KEY_LEN: usize = 65_000;

/// Serialized size of a page holding the given shape.
///
/// `value_offsets_size` switches to the `(u16, u32)` form for a single
/// entry.
fn page_size_for(num_elems: usize, num_blobs: usize, key_bytes: usize, value_bytes: usize) -> usize {
    let bitmap_words = num_elems.div_ceil(64);
    let crumb_words = num_elems.div_ceil(32);
    let value_offsets = if num_elems == 1 { 6 } else { 2 * (num_elems + 1) };
    DIR_SIZE
        + 8 * bitmap_words
        + 8 * crumb_words
        + 12 * num_blobs
        + 2 * num_elems
        + value_offsets
        + key_bytes
        + value_bytes
}

/// The top `precision` bits of a key, packed into a `u16`.
///
/// Keys shorter than 16 bits are treated as zero-extended. Precision 0
/// maps every key to bucket 0.
pub fn key_topbits(precision: u8, key: &[u8]) -> u16 {
    if precision == 0 {
        return 0;
    }
    let hi = key.first().copied().unwrap_or(0) as u16;
    let lo = key.get(1).copied().unwrap_or(0) as u16;
    let word = (hi << 8) | lo;
    word >> (16 - precision as u16)
}

/// The first 64 bits of a key, zero-extended, as a big-endian word.
///
/// Monotone in key order for keys that differ within their first eight
/// bytes; used by the compact index for in-bucket narrowing.
pub fn key_prefix64(key: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let n = key.len().min(8);
    bytes[..n].copy_from_slice(&key[..n]);
    u64::from_be_bytes(bytes)
}

// ------------------------------------------------------------------------------------------------
// PageAcc — accumulates entries until the page is full
// ------------------------------------------------------------------------------------------------

/// Accumulates `(key, entry)` pairs destined for one disk page.
///
/// [`PageAcc::try_add`] either accepts the pair or rejects it, signalling
/// that the caller must serialize the page and start a fresh one. A pair
/// offered to an empty accumulator is always accepted, so a single entry
/// with an oversized value becomes a multi-page emission.
pub struct PageAcc {
    precision: u8,
    keys: Vec<Key>,
    entries: Vec<Entry>,
    key_bytes: usize,
    value_bytes: usize,
    num_blobs: usize,
}

impl PageAcc {
    /// Creates an empty accumulator partitioning on `precision` top bits.
    pub fn new(precision: u8) -> Self {
        Self {
            precision,
            keys: Vec::new(),
            entries: Vec::new(),
            key_bytes: 0,
            value_bytes: 0,
            num_blobs: 0,
        }
    }

    /// Number of accumulated entries.
    pub fn num_elems(&self) -> usize {
        self.keys.len()
    }

    /// True when nothing has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// First accumulated key, if any.
    pub fn first_key(&self) -> Option<&[u8]> {
        self.keys.first().map(|k| k.as_slice())
    }

    /// Offers a pair to the page.
    ///
    /// Accepts when the page is empty, or when the projected serialized
    /// size stays within [`PAGE_SIZE`] *and* the key shares the page's
    /// top-bit prefix (the partitioning requirement behind the compact
    /// index). On rejection the pair is handed back unchanged and the
    /// caller must serialize this page before re-offering it.
    pub fn try_add(&mut self, key: Key, entry: Entry) -> Option<(Key, Entry)> {
        if !self.is_empty() {
            let first = &self.keys[0];
            if key_topbits(self.precision, first) != key_topbits(self.precision, &key) {
                return Some((key, entry));
            }
            let projected = page_size_for(
                self.num_elems() + 1,
                self.num_blobs + usize::from(entry.blob().is_some()),
                self.key_bytes + key.len(),
                self.value_bytes + entry.value().len(),
            );
            if projected > PAGE_SIZE {
                return Some((key, entry));
            }
        }
        self.key_bytes += key.len();
        self.value_bytes += entry.value().len();
        self.num_blobs += usize::from(entry.blob().is_some());
        self.keys.push(key);
        self.entries.push(entry);
        None
    }

    /// Serializes the accumulated entries and resets the accumulator.
    ///
    /// The returned buffer is zero-padded to a multiple of [`PAGE_SIZE`];
    /// it exceeds one page only for a single oversized entry.
    pub fn serialize(&mut self) -> Vec<u8> {
        let n = self.keys.len();
        debug_assert!(n > 0, "serializing an empty page");
        let bitmap_words = n.div_ceil(64);
        let crumb_words = n.div_ceil(32);

        // Bit-packed maps are built in zero-initialised words; only
        // non-zero bits perform an or, so trailing lanes of the final
        // word stay zero.
        let mut bitmap = vec![0u64; bitmap_words];
        let mut crumbs = vec![0u64; crumb_words];
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.blob().is_some() {
                bitmap[i / 64] |= 1u64 << (i % 64);
            }
            let op = entry.op_code() as u64;
            if op != 0 {
                crumbs[i / 32] |= op << (2 * (i % 32));
            }
        }

        let key_offsets_offset = DIR_SIZE + 8 * bitmap_words + 8 * crumb_words + 12 * self.num_blobs;
        let value_offsets_size = if n == 1 { 6 } else { 2 * (n + 1) };
        let keys_start = key_offsets_offset + 2 * n + value_offsets_size;
        let values_start = keys_start + self.key_bytes;
        let total = values_start + self.value_bytes;

        let mut buf = Vec::with_capacity(total.next_multiple_of(PAGE_SIZE));

        // (1) directory
        buf.extend_from_slice(&(n as u16).to_le_bytes());
        buf.extend_from_slice(&(self.num_blobs as u16).to_le_bytes());
        buf.extend_from_slice(&(key_offsets_offset as u16).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());

        // (2) blob-present bitmap, (3) operation crumbmap
        for word in &bitmap {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        for word in &crumbs {
            buf.extend_from_slice(&word.to_le_bytes());
        }

        // (4) blob spans, in entry order
        for entry in &self.entries {
            if let Some(span) = entry.blob() {
                buf.extend_from_slice(&span.offset.to_le_bytes());
                buf.extend_from_slice(&span.length.to_le_bytes());
            }
        }

        // (5) key offsets
        let mut koff = keys_start;
        for key in &self.keys {
            buf.extend_from_slice(&(koff as u16).to_le_bytes());
            koff += key.len();
        }

        // (6) value offsets
        if n == 1 {
            let end = values_start + self.value_bytes;
            buf.extend_from_slice(&(values_start as u16).to_le_bytes());
            buf.extend_from_slice(&(end as u32).to_le_bytes());
        } else {
            let mut voff = values_start;
            for entry in &self.entries {
                buf.extend_from_slice(&(voff as u16).to_le_bytes());
                voff += entry.value().len();
            }
            buf.extend_from_slice(&(voff as u16).to_le_bytes());
        }

        // (7) keys, (8) values
        for key in &self.keys {
            buf.extend_from_slice(key);
        }
        for entry in &self.entries {
            buf.extend_from_slice(entry.value());
        }

        // (9) zero padding to the next page boundary
        buf.resize(buf.len().next_multiple_of(PAGE_SIZE), 0);

        self.keys.clear();
        self.entries.clear();
        self.key_bytes = 0;
        self.value_bytes = 0;
        self.num_blobs = 0;

        buf
    }
}

// ------------------------------------------------------------------------------------------------
// RawPage — read-side view over serialized page bytes
// ------------------------------------------------------------------------------------------------

/// Read-side view over one serialized page.
///
/// The backing slice must start at a page boundary and, for a page with
/// an overflowing value, cover all of its continuation slots.
pub struct RawPage<'a> {
    bytes: &'a [u8],
    num_elems: usize,
    num_blobs: usize,
    key_offsets_offset: usize,
}

impl<'a> RawPage<'a> {
    /// Parses the directory and validates that the fixed-size regions lie
    /// within the slice.
    pub fn new(bytes: &'a [u8]) -> Result<Self, StoreError> {
        if bytes.len() < DIR_SIZE {
            return Err(StoreError::Corruption("page shorter than directory".into()));
        }
        let num_elems = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let num_blobs = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        let key_offsets_offset = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
        if num_elems == 0 {
            return Err(StoreError::Corruption("page holds zero entries".into()));
        }
        let expected = DIR_SIZE + 8 * num_elems.div_ceil(64) + 8 * num_elems.div_ceil(32) + 12 * num_blobs;
        if key_offsets_offset != expected {
            return Err(StoreError::Corruption(format!(
                "page directory inconsistent: key offsets at {key_offsets_offset}, expected {expected}"
            )));
        }
        let value_offsets_size = if num_elems == 1 { 6 } else { 2 * (num_elems + 1) };
        if key_offsets_offset + 2 * num_elems + value_offsets_size > bytes.len() {
            return Err(StoreError::Corruption("page offset arrays out of range".into()));
        }
        Ok(Self {
            bytes,
            num_elems,
            num_blobs,
            key_offsets_offset,
        })
    }

    /// Number of entries stored in this page.
    pub fn num_elems(&self) -> usize {
        self.num_elems
    }

    /// Number of blob references stored in this page.
    pub fn num_blobs(&self) -> usize {
        self.num_blobs
    }

    /// Total serialized length in bytes, including padding — always a
    /// multiple of [`PAGE_SIZE`]. Exceeds one page only for a single
    /// entry with an overflowing value.
    pub fn serialized_len(&self) -> usize {
        if self.num_elems == 1 {
            let (_, end) = self.single_value_bounds();
            end.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE)
        } else {
            PAGE_SIZE
        }
    }

    /// Number of [`PAGE_SIZE`] slots this page occupies in the k/ops file.
    pub fn slots(&self) -> usize {
        self.serialized_len() / PAGE_SIZE
    }

    #[inline]
    fn read_u16(&self, at: usize) -> usize {
        u16::from_le_bytes([self.bytes[at], self.bytes[at + 1]]) as usize
    }

    #[inline]
    fn key_offset(&self, i: usize) -> usize {
        self.read_u16(self.key_offsets_offset + 2 * i)
    }

    fn value_offsets_start(&self) -> usize {
        self.key_offsets_offset + 2 * self.num_elems
    }

    /// `(start, end)` of the sole value in the single-entry form.
    fn single_value_bounds(&self) -> (usize, usize) {
        let at = self.value_offsets_start();
        let start = self.read_u16(at);
        let end = u32::from_le_bytes([
            self.bytes[at + 2],
            self.bytes[at + 3],
            self.bytes[at + 4],
            self.bytes[at + 5],
        ]) as usize;
        (start, end)
    }

    fn value_bounds(&self, i: usize) -> (usize, usize) {
        if self.num_elems == 1 {
            self.single_value_bounds()
        } else {
            let at = self.value_offsets_start();
            (self.read_u16(at + 2 * i), self.read_u16(at + 2 * (i + 1)))
        }
    }

    /// Key bytes of entry `i`.
    pub fn key(&self, i: usize) -> &'a [u8] {
        let start = self.key_offset(i);
        let end = if i + 1 < self.num_elems {
            self.key_offset(i + 1)
        } else {
            // The last key ends where the first value begins.
            self.value_bounds(0).0
        };
        &self.bytes[start..end]
    }

    fn op_code(&self, i: usize) -> u8 {
        let word_at = DIR_SIZE + 8 * self.num_elems.div_ceil(64) + 8 * (i / 32);
        let mut word_bytes = [0u8; 8];
        word_bytes.copy_from_slice(&self.bytes[word_at..word_at + 8]);
        let word = u64::from_le_bytes(word_bytes);
        ((word >> (2 * (i % 32))) & 0b11) as u8
    }

    fn has_blob(&self, i: usize) -> bool {
        let word_at = DIR_SIZE + 8 * (i / 64);
        let mut word_bytes = [0u8; 8];
        word_bytes.copy_from_slice(&self.bytes[word_at..word_at + 8]);
        let word = u64::from_le_bytes(word_bytes);
        (word >> (i % 64)) & 1 == 1
    }

    /// Rank of entry `i` among blob-carrying entries, i.e. its slot in
    /// the blob span array. Only meaningful when `has_blob(i)`.
    fn blob_rank(&self, i: usize) -> usize {
        let mut rank = 0;
        let mut seen = 0;
        while seen < i {
            let word_at = DIR_SIZE + 8 * (seen / 64);
            let mut word_bytes = [0u8; 8];
            word_bytes.copy_from_slice(&self.bytes[word_at..word_at + 8]);
            let word = u64::from_le_bytes(word_bytes);
            let lanes = (i - seen).min(64 - seen % 64);
            let mask = if lanes == 64 {
                u64::MAX
            } else {
                ((1u64 << lanes) - 1) << (seen % 64)
            };
            rank += (word & mask).count_ones() as usize;
            seen += lanes;
        }
        rank
    }

    fn blob_span(&self, rank: usize) -> BlobSpan {
        let at = DIR_SIZE
            + 8 * self.num_elems.div_ceil(64)
            + 8 * self.num_elems.div_ceil(32)
            + 12 * rank;
        let mut off = [0u8; 8];
        off.copy_from_slice(&self.bytes[at..at + 8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&self.bytes[at + 8..at + 12]);
        BlobSpan {
            offset: u64::from_le_bytes(off),
            length: u32::from_le_bytes(len),
        }
    }

    /// Reconstructs entry `i`.
    pub fn entry(&self, i: usize) -> Result<Entry, StoreError> {
        let (start, end) = self.value_bounds(i);
        if end > self.bytes.len() || start > end {
            return Err(StoreError::Corruption(format!(
                "page value bounds {start}..{end} exceed {} bytes",
                self.bytes.len()
            )));
        }
        let value = self.bytes[start..end].to_vec();
        let entry = match self.op_code(i) {
            0 => {
                if self.has_blob(i) {
                    let span = self.blob_span(self.blob_rank(i));
                    Entry::InsertWithBlob(value, span)
                } else {
                    Entry::Insert(value)
                }
            }
            1 => Entry::Mupdate(value),
            2 => Entry::Delete,
            op => {
                return Err(StoreError::Corruption(format!(
                    "page entry {i} carries reserved operation code {op}"
                )));
            }
        };
        Ok(entry)
    }

    /// Binary search for `key` among this page's keys.
    pub fn search(&self, key: &[u8]) -> Option<usize> {
        let mut lo = 0usize;
        let mut hi = self.num_elems;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.key(mid).cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }
}

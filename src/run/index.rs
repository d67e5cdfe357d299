//! Compact index — maps a key to the candidate page span of a run.
//!
//! The index buckets pages by the top `range_finder_precision` bits of
//! their first key. The page-partitioning rule guarantees every key on a
//! page shares those bits with the page's first key, so a query key's
//! bucket holds exactly the pages that could contain it. Each page also
//! records the first 64 bits of its first key, letting a lookup narrow a
//! large bucket by binary search before touching disk.
//!
//! Construction is incremental and chunked: appends are staged and
//! processed [`chunk_size`](crate::config::StoreConfig::chunk_size) pages
//! at a time, each chunk performing contiguous [`fill_range`] writes into
//! the bucket array. Writes follow page order, so later writes only ever
//! extend the filled prefix.
//!
//! Page numbers are disk-page (slot) numbers: an entry whose value
//! overflows occupies one logical page spanning several consecutive
//! slots, and spans returned by [`CompactIndex::search`] cover all slots
//! of their boundary pages.

use crc32fast::Hasher as Crc32;

use crate::encoding::{self, Decode, Encode};
use crate::error::StoreError;
use crate::run::page::{key_prefix64, key_topbits};

const INDEX_MAGIC: [u8; 4] = *b"SCI1";
const INDEX_VERSION: u32 = 1;

/// A contiguous range of k/ops file slots, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    /// First slot of the span.
    pub lo: u32,
    /// Last slot of the span.
    pub hi: u32,
}

impl PageSpan {
    /// Number of slots covered.
    pub fn len(&self) -> usize {
        (self.hi - self.lo + 1) as usize
    }
}

/// Per-logical-page record: where the page starts and the 64-bit prefix
/// of its first key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageMeta {
    pub(crate) slot: u32,
    pub(crate) prefix: u64,
}

impl Encode for PageMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.slot.encode_to(buf);
        self.prefix.encode_to(buf);
    }
}

impl Decode for PageMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), encoding::EncodingError> {
        let (slot, n) = u32::decode_from(buf)?;
        let (prefix, m) = u64::decode_from(&buf[n..])?;
        Ok((Self { slot, prefix }, n + m))
    }
}

/// Writes `value` into `buf[lo..hi]`.
///
/// Correctness of the bucket array relies on callers issuing overlapping
/// writes in page order.
fn fill_range(buf: &mut [u32], lo: usize, hi: usize, value: u32) {
    for cell in &mut buf[lo..hi] {
        *cell = value;
    }
}

// ------------------------------------------------------------------------------------------------
// CompactIndex
// ------------------------------------------------------------------------------------------------

/// Memory-resident index from key top-bits to candidate page spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactIndex {
    precision: u8,
    /// `cum[b]` is the logical index of the first page whose bucket is
    /// `>= b`; `cum[1 << precision]` is the page count.
    cum: Vec<u32>,
    pages: Vec<PageMeta>,
    total_slots: u32,
}

impl CompactIndex {
    /// Number of logical pages indexed.
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Total k/ops file length in slots.
    pub fn total_slots(&self) -> u32 {
        self.total_slots
    }

    /// Starting slot of logical page `i`.
    pub(crate) fn page_slot(&self, i: usize) -> u32 {
        self.pages[i].slot
    }

    /// Candidate slot span for `key`, or `None` when no page can contain
    /// it.
    ///
    /// If `key` is present in the run, its page's slots are inside the
    /// returned span.
    pub fn search(&self, key: &[u8]) -> Option<PageSpan> {
        let (lo, hi) = self.search_logical(key)?;
        let slot_lo = self.pages[lo].slot;
        let slot_hi = if hi + 1 < self.pages.len() {
            self.pages[hi + 1].slot - 1
        } else {
            self.total_slots - 1
        };
        Some(PageSpan {
            lo: slot_lo,
            hi: slot_hi,
        })
    }

    /// Candidate logical page range for `key`, both ends inclusive.
    pub(crate) fn search_logical(&self, key: &[u8]) -> Option<(usize, usize)> {
        let bucket = key_topbits(self.precision, key) as usize;
        let lo = self.cum[bucket] as usize;
        let hi = self.cum[bucket + 1] as usize;
        if lo == hi {
            return None;
        }

        // Narrow by the 64-bit first-key prefix. A page whose prefix
        // exceeds the query's cannot contain it; the page just before
        // the first equal-prefix page still can.
        let kp = key_prefix64(key);
        let eq_lo = lo + self.pages[lo..hi].partition_point(|p| p.prefix < kp);
        let eq_hi = lo + self.pages[lo..hi].partition_point(|p| p.prefix <= kp);
        if eq_lo == eq_hi {
            if eq_lo == lo {
                // Every page in the bucket starts beyond the query key.
                return None;
            }
            return Some((eq_lo - 1, eq_lo - 1));
        }
        let narrowed_lo = if eq_lo > lo { eq_lo - 1 } else { lo };
        Some((narrowed_lo, eq_hi - 1))
    }

    /// Logical page from which a forward scan is guaranteed to meet the
    /// first entry `>= key`: the last page whose first-key prefix is
    /// strictly below the query's (every earlier page ends before it).
    pub(crate) fn seek_page(&self, key: &[u8]) -> Option<usize> {
        if self.pages.is_empty() {
            return None;
        }
        let kp = key_prefix64(key);
        let n = self.pages.partition_point(|p| p.prefix < kp);
        Some(n.saturating_sub(1))
    }

    /// Serializes the index into the `.index` sidecar byte form.
    pub fn to_file_bytes(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        (self.precision as u16).encode_to(&mut payload);
        (self.pages.len() as u32).encode_to(&mut payload);
        self.total_slots.encode_to(&mut payload);
        encoding::encode_seq(&self.cum, &mut payload);
        encoding::encode_seq(&self.pages, &mut payload);

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut buf = Vec::new();
        INDEX_MAGIC.encode_to(&mut buf);
        INDEX_VERSION.encode_to(&mut buf);
        payload.encode_to(&mut buf);
        crc.encode_to(&mut buf);
        buf
    }

    /// Reconstructs an index from `.index` sidecar bytes.
    pub fn from_file_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&bytes[off..])?;
        off += n;
        if magic != INDEX_MAGIC {
            return Err(StoreError::Corruption("index file magic mismatch".into()));
        }
        let (version, n) = u32::decode_from(&bytes[off..])?;
        off += n;
        if version != INDEX_VERSION {
            return Err(StoreError::Corruption(format!(
                "index file version {version} not supported"
            )));
        }
        let (payload, n) = Vec::<u8>::decode_from(&bytes[off..])?;
        off += n;
        let (stored_crc, _) = u32::decode_from(&bytes[off..])?;

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        if hasher.finalize() != stored_crc {
            return Err(StoreError::Corruption("index file checksum mismatch".into()));
        }

        let mut off = 0;
        let (precision, n) = u16::decode_from(&payload[off..])?;
        off += n;
        let (num_pages, n) = u32::decode_from(&payload[off..])?;
        off += n;
        let (total_slots, n) = u32::decode_from(&payload[off..])?;
        off += n;
        let (cum, n) = encoding::decode_seq::<u32>(&payload[off..])?;
        off += n;
        let (pages, _) = encoding::decode_seq::<PageMeta>(&payload[off..])?;

        if precision > 16 {
            return Err(StoreError::Corruption(format!(
                "index precision {precision} out of range"
            )));
        }
        if cum.len() != (1usize << precision) + 1 || pages.len() != num_pages as usize {
            return Err(StoreError::Corruption("index structure inconsistent".into()));
        }
        Ok(Self {
            precision: precision as u8,
            cum,
            pages,
            total_slots,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// IndexBuilder — incremental, chunked construction
// ------------------------------------------------------------------------------------------------

/// Builds a [`CompactIndex`] one finished page at a time.
pub struct IndexBuilder {
    precision: u8,
    chunk_size: usize,
    cum: Vec<u32>,
    pages: Vec<PageMeta>,
    /// Buckets below this are final; the next fill starts here.
    filled_to: usize,
    total_slots: u32,
    /// Staged appends, processed [`chunk_size`] pages at a time.
    chunk: Vec<(usize, PageMeta)>,
}

impl IndexBuilder {
    /// Creates a builder for the given top-bit precision and chunk size.
    pub fn new(precision: u8, chunk_size: usize) -> Self {
        let buckets = (1usize << precision) + 1;
        Self {
            precision,
            chunk_size: chunk_size.max(1),
            cum: vec![0; buckets],
            pages: Vec::new(),
            filled_to: 0,
            total_slots: 0,
            chunk: Vec::new(),
        }
    }

    /// Registers a finished page by its first key and the number of
    /// slots it occupies (more than one only for an oversized entry).
    pub fn append(&mut self, first_key: &[u8], slots: usize) {
        let bucket = key_topbits(self.precision, first_key) as usize;
        let meta = PageMeta {
            slot: self.total_slots,
            prefix: key_prefix64(first_key),
        };
        self.total_slots += slots as u32;
        self.chunk.push((bucket, meta));
        if self.chunk.len() >= self.chunk_size {
            self.flush_chunk();
        }
    }

    fn flush_chunk(&mut self) {
        for (bucket, meta) in self.chunk.drain(..) {
            // Pages arrive in key order, so buckets never regress.
            debug_assert!(bucket + 1 >= self.filled_to);
            let page_ix = self.pages.len() as u32;
            if bucket + 1 > self.filled_to {
                fill_range(&mut self.cum, self.filled_to, bucket + 1, page_ix);
                self.filled_to = bucket + 1;
            }
            self.pages.push(meta);
        }
    }

    /// Finalizes the remaining buckets and returns the finished index.
    pub fn finish(mut self) -> CompactIndex {
        self.flush_chunk();
        let num_pages = self.pages.len() as u32;
        let buckets = self.cum.len();
        fill_range(&mut self.cum, self.filled_to, buckets, num_pages);
        CompactIndex {
            precision: self.precision,
            cum: self.cum,
            pages: self.pages,
            total_slots: self.total_slots,
        }
    }
}

//! Engine configuration.
//!
//! A [`StoreConfig`] is supplied when a session is opened and applies to
//! every table created through it. All knobs have workable defaults; the
//! two that shape the on-disk format of new runs are
//! [`StoreConfig::bloom_filter_alloc`] and
//! [`StoreConfig::range_finder_precision`].

/// Sizing strategy for the per-run bloom filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomFilterAlloc {
    /// Allocate a fixed number of filter bits per inserted key.
    ///
    /// Ten bits per key gives roughly a 1% false-positive rate with the
    /// optimal hash count.
    FixedBitsPerEntry(u32),
}

impl BloomFilterAlloc {
    /// Filter size in bytes for a run expected to hold `entries` keys.
    ///
    /// Always at least one byte so that an empty run still produces a
    /// well-formed filter file.
    pub fn bytes_for(&self, entries: usize) -> usize {
        match self {
            BloomFilterAlloc::FixedBitsPerEntry(bits) => {
                let total_bits = (*bits as usize).saturating_mul(entries);
                total_bits.div_ceil(8).max(1)
            }
        }
    }
}

/// Whether decoded run pages are retained in the in-memory page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Keep recently decoded pages cached for future lookups.
    CacheRunData,
    /// Decode pages on every access.
    NoCacheRunData,
}

/// Configuration for a session and the tables it creates.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Bloom filter sizing for newly built runs.
    pub bloom_filter_alloc: BloomFilterAlloc,

    /// Number of page appends the compact-index builder processes per
    /// chunk. Bounds the builder's intermediate memory.
    pub chunk_size: usize,

    /// Maximum number of pages fetched by a single block-I/O submission
    /// during lookups.
    pub batch_size: usize,

    /// Page cache behavior for lookups.
    pub cache_policy: CachePolicy,

    /// Number of high-order key bits used by the compact index and the
    /// page partitioning rule. Valid range 0–16.
    pub range_finder_precision: u8,

    /// Number of entries the write buffer holds before it is flushed to
    /// a level-0 run.
    pub write_buffer_entries: usize,

    /// Number of runs a level may hold before its runs are handed to a
    /// merge targeting the next level.
    pub level_run_bound: usize,

    /// Capacity of the decoded-page cache, in pages. Ignored under
    /// [`CachePolicy::NoCacheRunData`].
    pub page_cache_pages: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bloom_filter_alloc: BloomFilterAlloc::FixedBitsPerEntry(10),
            chunk_size: 100,
            batch_size: 64,
            cache_policy: CachePolicy::CacheRunData,
            range_finder_precision: 10,
            write_buffer_entries: 1000,
            level_run_bound: 4,
            page_cache_pages: 1024,
        }
    }
}

impl StoreConfig {
    /// Clamp out-of-range fields into their valid domains.
    ///
    /// Applied once when a session adopts the config so the rest of the
    /// engine can assume the invariants hold.
    pub(crate) fn sanitized(mut self) -> Self {
        self.range_finder_precision = self.range_finder_precision.min(16);
        self.chunk_size = self.chunk_size.max(1);
        self.batch_size = self.batch_size.max(1);
        self.write_buffer_entries = self.write_buffer_entries.max(1);
        self.level_run_bound = self.level_run_bound.max(2);
        self
    }
}

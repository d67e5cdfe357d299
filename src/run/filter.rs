//! Per-run bloom filter and its sidecar file format.
//!
//! Each run carries a bloom filter over its keys, sized at construction
//! time from the expected entry count and the configured
//! [`BloomFilterAlloc`]. The filter admits false positives but never a
//! false negative for an inserted key.
//!
//! The `.filter` sidecar is `[magic][version][payload][crc32]` where the
//! payload is the filter's self-describing byte form (bitmap plus sip
//! keys and hash count).

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;

use crate::config::BloomFilterAlloc;
use crate::encoding::{Decode, Encode};
use crate::error::StoreError;

const FILTER_MAGIC: [u8; 4] = *b"SBF1";
const FILTER_VERSION: u32 = 1;

/// A run's key membership filter.
pub struct RunFilter {
    bloom: Bloom<[u8]>,
    bitmap_bytes: usize,
}

impl RunFilter {
    /// Allocates a filter for a run expected to hold `expected_entries`
    /// keys.
    pub fn new(alloc: BloomFilterAlloc, expected_entries: usize) -> Result<Self, StoreError> {
        let bitmap_bytes = alloc.bytes_for(expected_entries);
        let bloom = Bloom::new(bitmap_bytes, expected_entries.max(1))
            .map_err(|e| StoreError::Corruption(format!("bloom allocation failed: {e}")))?;
        Ok(Self { bloom, bitmap_bytes })
    }

    /// Records a key.
    pub fn insert(&mut self, key: &[u8]) {
        self.bloom.set(key);
    }

    /// Whether the key may be present. `false` is definitive.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.bloom.check(key)
    }

    /// Allocated bitmap size in bits.
    pub fn bitmap_bits(&self) -> usize {
        self.bitmap_bytes * 8
    }

    /// Serializes the filter into the `.filter` sidecar byte form.
    pub fn to_file_bytes(&self) -> Vec<u8> {
        let payload = self.bloom.as_slice().to_vec();
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut buf = Vec::new();
        FILTER_MAGIC.encode_to(&mut buf);
        FILTER_VERSION.encode_to(&mut buf);
        payload.encode_to(&mut buf);
        crc.encode_to(&mut buf);
        buf
    }

    /// Reconstructs a filter from `.filter` sidecar bytes.
    pub fn from_file_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&bytes[off..])?;
        off += n;
        if magic != FILTER_MAGIC {
            return Err(StoreError::Corruption("filter file magic mismatch".into()));
        }
        let (version, n) = u32::decode_from(&bytes[off..])?;
        off += n;
        if version != FILTER_VERSION {
            return Err(StoreError::Corruption(format!(
                "filter file version {version} not supported"
            )));
        }
        let (payload, n) = Vec::<u8>::decode_from(&bytes[off..])?;
        off += n;
        let (stored_crc, _) = u32::decode_from(&bytes[off..])?;

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        if hasher.finalize() != stored_crc {
            return Err(StoreError::Corruption("filter file checksum mismatch".into()));
        }

        let bloom = Bloom::from_slice(&payload)
            .map_err(|e| StoreError::Corruption(format!("filter payload malformed: {e}")))?;
        let bitmap_bytes = payload.len();
        Ok(Self { bloom, bitmap_bytes })
    }
}

impl std::fmt::Debug for RunFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunFilter")
            .field("bitmap_bytes", &self.bitmap_bytes)
            .finish()
    }
}

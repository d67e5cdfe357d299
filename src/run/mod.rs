//! Run — an immutable, sorted, on-disk table of key/operation pages.
//!
//! A run consists of four files sharing a numeric identifier:
//!
//! - `<id>.keyops` — concatenation of 4096-byte pages (see [`page`]).
//! - `<id>.blobs`  — raw blob bytes addressed by [`BlobSpan`].
//! - `<id>.filter` — serialized bloom filter (see [`filter`]).
//! - `<id>.index`  — serialized compact index (see [`index`]).
//!
//! In memory a run carries its bloom filter, its compact index, memory
//! maps of the k/ops and blob files, and its entry count. Runs are
//! shared by reference (`Arc<Run>`) across tables, snapshots, and
//! in-progress merges; when the last reference drops, the run unlinks
//! all four files.
//!
//! Runs are created by flushing a write buffer or by a completing merge,
//! and never modified afterwards, so the read-only memory maps are safe
//! to share across threads.

pub mod builder;
pub mod cursor;
pub mod filter;
pub mod index;
pub mod page;

#[cfg(test)]
mod tests;

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::entry::BlobSpan;
use crate::error::StoreError;
use crate::write_buffer::WriteBuffer;
use builder::{RunBuilder, RunBuilt};
use filter::RunFilter;
use index::CompactIndex;
use page::{PAGE_SIZE, RawPage};

// ------------------------------------------------------------------------------------------------
// RunPaths
// ------------------------------------------------------------------------------------------------

/// The four file paths of a run, derived from a directory and an id.
#[derive(Debug, Clone)]
pub struct RunPaths {
    dir: PathBuf,
    id: u64,
}

impl RunPaths {
    /// Paths for run `id` inside `dir`.
    pub fn new(dir: impl Into<PathBuf>, id: u64) -> Self {
        Self { dir: dir.into(), id }
    }

    /// The run's numeric identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn file(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{ext}", self.id))
    }

    /// Path of the k/ops page file.
    pub fn keyops(&self) -> PathBuf {
        self.file("keyops")
    }

    /// Path of the blob file.
    pub fn blobs(&self) -> PathBuf {
        self.file("blobs")
    }

    /// Path of the bloom filter sidecar.
    pub fn filter(&self) -> PathBuf {
        self.file("filter")
    }

    /// Path of the compact index sidecar.
    pub fn index(&self) -> PathBuf {
        self.file("index")
    }

    /// All four final paths.
    pub fn all(&self) -> [PathBuf; 4] {
        [self.keyops(), self.blobs(), self.filter(), self.index()]
    }

    pub(crate) fn keyops_tmp(&self) -> PathBuf {
        self.file("keyops.tmp")
    }

    pub(crate) fn blobs_tmp(&self) -> PathBuf {
        self.file("blobs.tmp")
    }

    pub(crate) fn filter_tmp(&self) -> PathBuf {
        self.file("filter.tmp")
    }

    pub(crate) fn index_tmp(&self) -> PathBuf {
        self.file("index.tmp")
    }
}

// ------------------------------------------------------------------------------------------------
// Run
// ------------------------------------------------------------------------------------------------

/// An immutable on-disk run. Share as `Arc<Run>`; the last reference
/// unlinks the run's files.
pub struct Run {
    paths: RunPaths,
    num_entries: u64,
    filter: RunFilter,
    index: CompactIndex,
    /// `None` for a zero-length file (an empty run, or a run with no
    /// blobs) — empty files cannot be mapped.
    keyops: Option<Mmap>,
    blobs: Option<Mmap>,
}

impl Run {
    /// Builds a run by streaming an ordered write buffer through the
    /// page, filter, and index builders.
    pub fn from_write_buffer(
        config: &StoreConfig,
        paths: RunPaths,
        buffer: &WriteBuffer,
    ) -> Result<Arc<Run>, StoreError> {
        let mut builder = RunBuilder::new(config, paths, buffer.num_entries())?;
        for (key, entry) in buffer {
            builder.add_raw(key.clone(), entry.clone())?;
        }
        let built = builder.finish()?;
        Self::from_built(built)
    }

    /// Opens a freshly built run, reusing the builder's in-memory filter
    /// and index.
    pub fn from_built(built: RunBuilt) -> Result<Arc<Run>, StoreError> {
        let keyops = map_file(&built.paths.keyops())?;
        let blobs = map_file(&built.paths.blobs())?;
        debug!(
            run_id = built.paths.id(),
            entries = built.num_entries,
            "run opened"
        );
        Ok(Arc::new(Run {
            paths: built.paths,
            num_entries: built.num_entries,
            filter: built.filter,
            index: built.index,
            keyops,
            blobs,
        }))
    }

    /// Opens an existing run from its four files, verifying the sidecar
    /// checksums and recomputing the entry count from the page
    /// directories.
    pub fn open(paths: RunPaths) -> Result<Arc<Run>, StoreError> {
        let filter = RunFilter::from_file_bytes(&fs::read(paths.filter())?)?;
        let index = CompactIndex::from_file_bytes(&fs::read(paths.index())?)?;
        let keyops = map_file(&paths.keyops())?;
        let blobs = map_file(&paths.blobs())?;

        let bytes = keyops.as_deref().map(|m| &m[..]).unwrap_or(&[]);
        if bytes.len() % PAGE_SIZE != 0 {
            return Err(StoreError::Corruption(format!(
                "k/ops file length {} is not page-aligned",
                bytes.len()
            )));
        }
        if bytes.len() / PAGE_SIZE != index.total_slots() as usize {
            return Err(StoreError::Corruption(format!(
                "k/ops file holds {} slots, index expects {}",
                bytes.len() / PAGE_SIZE,
                index.total_slots()
            )));
        }
        let mut num_entries = 0u64;
        for page_ix in 0..index.num_pages() {
            let slot = index.page_slot(page_ix) as usize;
            let page = RawPage::new(&bytes[slot * PAGE_SIZE..])?;
            num_entries += page.num_elems() as u64;
        }

        Ok(Arc::new(Run {
            paths,
            num_entries,
            filter,
            index,
            keyops,
            blobs,
        }))
    }

    /// The run's numeric identifier.
    pub fn id(&self) -> u64 {
        self.paths.id()
    }

    /// The run's four file paths.
    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Number of entries stored.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// The run's bloom filter.
    pub fn filter(&self) -> &RunFilter {
        &self.filter
    }

    /// The run's compact index.
    pub fn index(&self) -> &CompactIndex {
        &self.index
    }

    /// The raw bytes of the k/ops file.
    pub fn keyops_bytes(&self) -> &[u8] {
        self.keyops.as_deref().map(|m| &m[..]).unwrap_or(&[])
    }

    /// Reads a blob out of the run's blob file.
    pub fn read_blob(&self, span: BlobSpan) -> Result<Vec<u8>, StoreError> {
        let bytes = self.blobs.as_deref().map(|m| &m[..]).unwrap_or(&[]);
        let start = span.offset as usize;
        let end = start + span.length as usize;
        if end > bytes.len() {
            return Err(StoreError::Corruption(format!(
                "blob span {}..{} exceeds blob file of {} bytes",
                start,
                end,
                bytes.len()
            )));
        }
        Ok(bytes[start..end].to_vec())
    }
}

impl Drop for Run {
    /// The last reference unlinks the run's four files.
    fn drop(&mut self) {
        debug!(run_id = self.paths.id(), "run released, unlinking files");
        for path in self.paths.all() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), %e, "failed to unlink run file"),
            }
        }
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.paths.id())
            .field("num_entries", &self.num_entries)
            .field("pages", &self.index.num_pages())
            .finish()
    }
}

/// Maps a file read-only; a zero-length file maps to `None`.
///
/// Safety: run files are never written after the rename that puts them
/// in place, and the maps are read-only.
fn map_file(path: &Path) -> Result<Option<Mmap>, StoreError> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(Some(mmap))
}

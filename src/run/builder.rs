//! Run writer — builds the four run files from a sorted entry stream.
//!
//! The builder accepts `(key, entry)` pairs in strictly increasing key
//! order and streams them through the page accumulator, the bloom
//! filter, and the compact-index builder, emitting pages to the k/ops
//! file and blob payloads to the blob file as it goes.
//!
//! # Atomicity
//!
//! All four files are written under `.tmp` suffixes. [`RunBuilder::finish`]
//! flushes, fsyncs, and renames them into place; dropping an unfinished
//! builder (or calling [`RunBuilder::abort`]) removes the temporaries, so
//! a cancelled build leaves nothing behind.

use std::fs::{File, OpenOptions, rename};
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::trace;

use crate::config::StoreConfig;
use crate::entry::{BlobSpan, Entry, Key};
use crate::error::StoreError;
use crate::run::RunPaths;
use crate::run::filter::RunFilter;
use crate::run::index::{CompactIndex, IndexBuilder};
use crate::run::page::{PAGE_SIZE, PageAcc};
use crate::write_buffer::RawEntry;

/// The in-memory artifacts of a finished build, handed to
/// [`Run::from_built`](crate::run::Run::from_built) so the fresh run does
/// not re-read its own sidecars.
pub struct RunBuilt {
    pub(crate) paths: RunPaths,
    pub(crate) filter: RunFilter,
    pub(crate) index: CompactIndex,
    pub(crate) num_entries: u64,
}

/// Removes the four `.tmp` files unless the build finished.
struct TmpGuard {
    paths: RunPaths,
    armed: bool,
}

impl Drop for TmpGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for path in [
            self.paths.keyops_tmp(),
            self.paths.blobs_tmp(),
            self.paths.filter_tmp(),
            self.paths.index_tmp(),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), %e, "failed to remove partial run file")
                }
            }
        }
    }
}

/// Streaming builder for one run.
pub struct RunBuilder {
    tmp: TmpGuard,
    keyops: BufWriter<File>,
    blobs: BufWriter<File>,
    acc: PageAcc,
    filter: RunFilter,
    index: IndexBuilder,
    num_entries: u64,
    blob_offset: u64,
}

impl RunBuilder {
    /// Opens the temporary files and sizes the bloom filter for
    /// `expected_entries` keys.
    pub fn new(
        config: &StoreConfig,
        paths: RunPaths,
        expected_entries: usize,
    ) -> Result<Self, StoreError> {
        let keyops = open_tmp(&paths.keyops_tmp())?;
        let blobs = open_tmp(&paths.blobs_tmp())?;
        let filter = RunFilter::new(config.bloom_filter_alloc, expected_entries)?;
        let index = IndexBuilder::new(config.range_finder_precision, config.chunk_size);
        trace!(run_id = paths.id(), expected_entries, "run build started");
        Ok(Self {
            tmp: TmpGuard { paths, armed: true },
            keyops: BufWriter::new(keyops),
            blobs: BufWriter::new(blobs),
            acc: PageAcc::new(config.range_finder_precision),
            filter,
            index,
            num_entries: 0,
            blob_offset: 0,
        })
    }

    /// Adds an entry whose blob payload (if any) is still raw bytes —
    /// the write-buffer form. The blob is appended to the blob file and
    /// replaced by its span.
    pub fn add_raw(&mut self, key: Key, entry: RawEntry) -> Result<(), StoreError> {
        let entry = match entry {
            Entry::InsertWithBlob(value, blob) => {
                let span = self.append_blob(&blob)?;
                Entry::InsertWithBlob(value, span)
            }
            Entry::Insert(v) => Entry::Insert(v),
            Entry::Mupdate(v) => Entry::Mupdate(v),
            Entry::Delete => Entry::Delete,
        };
        self.add(key, entry)
    }

    /// Adds an entry whose blob payload has already been copied into
    /// this run's blob file via [`RunBuilder::append_blob`] (the merge
    /// path fetches blob bytes from the input run first).
    pub fn add(&mut self, key: Key, entry: Entry<BlobSpan>) -> Result<(), StoreError> {
        self.filter.insert(&key);
        self.num_entries += 1;
        if let Some((key, entry)) = self.acc.try_add(key, entry) {
            self.emit_page()?;
            let rejected = self.acc.try_add(key, entry);
            debug_assert!(rejected.is_none(), "an empty page accepts any entry");
        }
        Ok(())
    }

    /// Copies blob bytes into the blob file and returns their span.
    pub fn append_blob(&mut self, blob: &[u8]) -> Result<BlobSpan, StoreError> {
        let span = BlobSpan {
            offset: self.blob_offset,
            length: blob.len() as u32,
        };
        self.blobs.write_all(blob)?;
        self.blob_offset += blob.len() as u64;
        Ok(span)
    }

    /// Entries added so far.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    fn emit_page(&mut self) -> Result<(), StoreError> {
        if self.acc.is_empty() {
            return Ok(());
        }
        let first_key = self.acc.first_key().map(<[u8]>::to_vec).unwrap_or_default();
        let bytes = self.acc.serialize();
        self.index.append(&first_key, bytes.len() / PAGE_SIZE);
        self.keyops.write_all(&bytes)?;
        Ok(())
    }

    /// Flushes the final page, writes the sidecars, fsyncs everything,
    /// and renames the four files into place.
    pub fn finish(mut self) -> Result<RunBuilt, StoreError> {
        self.emit_page()?;

        self.keyops.flush()?;
        self.keyops.get_ref().sync_all()?;
        self.blobs.flush()?;
        self.blobs.get_ref().sync_all()?;

        let Self {
            mut tmp,
            filter,
            index,
            num_entries,
            ..
        } = self;
        let index = index.finish();
        write_sidecar(&tmp.paths.filter_tmp(), &filter.to_file_bytes())?;
        write_sidecar(&tmp.paths.index_tmp(), &index.to_file_bytes())?;

        rename(tmp.paths.keyops_tmp(), tmp.paths.keyops())?;
        rename(tmp.paths.blobs_tmp(), tmp.paths.blobs())?;
        rename(tmp.paths.filter_tmp(), tmp.paths.filter())?;
        rename(tmp.paths.index_tmp(), tmp.paths.index())?;
        tmp.armed = false;

        trace!(
            run_id = tmp.paths.id(),
            entries = num_entries,
            pages = index.num_pages(),
            "run build finished"
        );

        Ok(RunBuilt {
            paths: tmp.paths.clone(),
            filter,
            index,
            num_entries,
        })
    }

    /// Cancels the build, removing the temporary files.
    pub fn abort(self) {
        // The drop guard unlinks the temporaries.
    }
}

fn open_tmp(path: &Path) -> Result<File, StoreError> {
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?)
}

fn write_sidecar(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file = open_tmp(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

//! Batched lookup pipeline — bloom probe, index search, page fetch.
//!
//! A batch of query keys is driven through three stages against a set of
//! runs (newest first):
//!
//! 1. **Bloom stage** — probe each run's bloom filter for each key and
//!    keep the sparse set of `(run, key)` survivors.
//! 2. **Index stage** — consult each surviving run's compact index for
//!    the candidate page span.
//! 3. **I/O stage** — group page fetches into submissions of at most
//!    `batch_size` pages, coalescing adjacent spans from the same run
//!    into single contiguous reads, then search the fetched pages.
//!
//! Results come back in input-key order. When several runs hold the same
//! key, newer runs win; a chain of `Mupdate` entries folds across runs
//! with the host's `⊕` until an absorbing `Insert` or `Delete` is met.

#[cfg(test)]
mod tests;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::entry::{BlobSpan, Entry, Key, Resolve, Value, combine};
use crate::error::StoreError;
use crate::run::Run;
use crate::run::index::PageSpan;
use crate::run::page::{PAGE_SIZE, RawPage};

/// Outcome of a single key's lookup across a set of runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// No run holds the key.
    NotFound(Key),
    /// The key resolves to a value.
    Found(Key, Value),
    /// The key resolves to a value with an out-of-line blob.
    FoundWithBlob(Key, Value, BlobSpan),
}

/// A surviving `(run, key)` pair with its candidate page span.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub(crate) run_ix: usize,
    pub(crate) key_ix: usize,
    pub(crate) span: PageSpan,
}

/// One block-I/O submission: a contiguous slot range within one run,
/// covering at most `batch_size` pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IoOp {
    pub(crate) run_ix: usize,
    pub(crate) slot_lo: u32,
    pub(crate) slot_hi: u32,
    /// Indices into the candidate list served by this submission.
    pub(crate) candidates: Vec<usize>,
}

/// Groups candidate spans into submissions.
///
/// Candidates must be sorted by `(run_ix, span.lo)`. Adjacent or
/// overlapping spans within a run are merged while the submission stays
/// within `batch_size` pages; a single span larger than `batch_size`
/// becomes its own oversized submission.
pub(crate) fn plan_io(candidates: &[Candidate], batch_size: usize) -> Vec<IoOp> {
    let mut ops: Vec<IoOp> = Vec::new();
    for (ix, cand) in candidates.iter().enumerate() {
        if let Some(op) = ops.last_mut() {
            let adjacent = op.run_ix == cand.run_ix && cand.span.lo <= op.slot_hi + 1;
            let merged_pages = (cand.span.hi.max(op.slot_hi) - op.slot_lo + 1) as usize;
            if adjacent && merged_pages <= batch_size {
                op.slot_hi = op.slot_hi.max(cand.span.hi);
                op.candidates.push(ix);
                continue;
            }
        }
        ops.push(IoOp {
            run_ix: cand.run_ix,
            slot_lo: cand.span.lo,
            slot_hi: cand.span.hi,
            candidates: vec![ix],
        });
    }
    ops
}

/// Searches a fetched span for `key`, walking its pages front to back.
fn search_span(bytes: &[u8], key: &[u8]) -> Result<Option<Entry>, StoreError> {
    let mut off = 0;
    while off < bytes.len() {
        let page = RawPage::new(&bytes[off..])?;
        if let Some(i) = page.search(key) {
            return page.entry(i).map(Some);
        }
        off += page.serialized_len();
    }
    Ok(None)
}

/// Batched lookup returning, per input key, the resolved entry and the
/// index of the run whose entry supplied any surviving blob span.
pub(crate) fn lookups_raw(
    batch_size: usize,
    cache: Option<&PageCache>,
    keys: &[Key],
    runs: &[Arc<Run>],
    resolve: &Resolve,
) -> Result<Vec<Option<(Entry, usize)>>, StoreError> {
    // Stage 1: bloom probes.
    let mut survivors: Vec<(usize, usize)> = Vec::new();
    for (run_ix, run) in runs.iter().enumerate() {
        for (key_ix, key) in keys.iter().enumerate() {
            if run.filter().may_contain(key) {
                survivors.push((run_ix, key_ix));
            }
        }
    }

    // Stage 2: index searches.
    let mut candidates: Vec<Candidate> = Vec::new();
    for (run_ix, key_ix) in survivors {
        if let Some(span) = runs[run_ix].index().search(&keys[key_ix]) {
            candidates.push(Candidate { run_ix, key_ix, span });
        }
    }
    candidates.sort_by_key(|c| (c.run_ix, c.span.lo, c.key_ix));

    // Stage 3: resolve cached spans, batch the rest into submissions.
    let mut found: Vec<(usize, usize, Entry)> = Vec::new(); // (key_ix, run_ix, entry)
    let mut uncached: Vec<Candidate> = Vec::new();
    for cand in &candidates {
        let run = &runs[cand.run_ix];
        match cache.and_then(|c| c.get(run.id(), cand.span)) {
            Some(bytes) => {
                if let Some(entry) = search_span(&bytes, &keys[cand.key_ix])? {
                    found.push((cand.key_ix, cand.run_ix, entry));
                }
            }
            None => uncached.push(*cand),
        }
    }

    let ops = plan_io(&uncached, batch_size);
    trace!(
        keys = keys.len(),
        runs = runs.len(),
        candidates = candidates.len(),
        submissions = ops.len(),
        "lookup batch planned"
    );
    for op in &ops {
        let run = &runs[op.run_ix];
        let bytes = run.keyops_bytes();
        let op_lo = op.slot_lo as usize * PAGE_SIZE;
        let op_hi = ((op.slot_hi as usize + 1) * PAGE_SIZE).min(bytes.len());
        if op_lo >= op_hi {
            return Err(StoreError::Corruption(format!(
                "page span {}..{} outside k/ops file",
                op.slot_lo, op.slot_hi
            )));
        }
        let fetched = &bytes[op_lo..op_hi];
        for &cand_ix in &op.candidates {
            let cand = uncached[cand_ix];
            let lo = (cand.span.lo - op.slot_lo) as usize * PAGE_SIZE;
            let hi = (((cand.span.hi - op.slot_lo) as usize + 1) * PAGE_SIZE).min(fetched.len());
            let span_bytes = &fetched[lo..hi];
            if let Some(entry) = search_span(span_bytes, &keys[cand.key_ix])? {
                found.push((cand.key_ix, cand.run_ix, entry));
            }
            if let Some(c) = cache {
                c.insert(run.id(), cand.span, span_bytes);
            }
        }
    }

    // Per-key resolution, newest run first, stopping at the first
    // absorbing entry.
    let mut per_key: Vec<Vec<(usize, Entry)>> = vec![Vec::new(); keys.len()];
    for (key_ix, run_ix, entry) in found {
        per_key[key_ix].push((run_ix, entry));
    }
    let mut results = Vec::with_capacity(keys.len());
    for mut entries in per_key {
        entries.sort_by_key(|(run_ix, _)| *run_ix);
        let mut acc: Option<(Entry, usize)> = None;
        for (run_ix, entry) in entries {
            match acc {
                None => acc = Some((entry, run_ix)),
                Some((newer, source)) => {
                    if !matches!(newer, Entry::Mupdate(_)) {
                        acc = Some((newer, source));
                        break;
                    }
                    acc = Some((combine(resolve, newer, entry), source));
                }
            }
        }
        results.push(acc);
    }
    Ok(results)
}

/// Batched lookup over a set of runs, newest first.
///
/// Results are returned in the same order as `keys`.
pub fn lookups(
    batch_size: usize,
    cache: Option<&PageCache>,
    keys: &[Key],
    runs: &[Arc<Run>],
    resolve: &Resolve,
) -> Result<Vec<LookupResult>, StoreError> {
    let raw = lookups_raw(batch_size, cache, keys, runs, resolve)?;
    let results = raw
        .into_iter()
        .zip(keys.iter())
        .map(|(acc, key)| match acc {
            None | Some((Entry::Delete, _)) => LookupResult::NotFound(key.clone()),
            Some((Entry::Insert(v), _)) | Some((Entry::Mupdate(v), _)) => {
                LookupResult::Found(key.clone(), v)
            }
            Some((Entry::InsertWithBlob(v, span), _)) => {
                LookupResult::FoundWithBlob(key.clone(), v, span)
            }
        })
        .collect();
    Ok(results)
}

// ------------------------------------------------------------------------------------------------
// PageCache
// ------------------------------------------------------------------------------------------------

/// Bounded cache of fetched page spans, keyed by `(run id, first slot)`.
///
/// Consulted by the I/O stage before planning submissions; spans served
/// from the cache skip block I/O entirely. Eviction is FIFO by insertion
/// order, bounded by a total page budget.
pub struct PageCache {
    inner: Mutex<CacheInner>,
    capacity_pages: usize,
}

struct CacheInner {
    map: HashMap<(u64, u32), Arc<Vec<u8>>>,
    order: VecDeque<(u64, u32)>,
    pages_held: usize,
}

impl PageCache {
    /// Creates a cache bounded to `capacity_pages` pages.
    pub fn new(capacity_pages: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                pages_held: 0,
            }),
            capacity_pages: capacity_pages.max(1),
        }
    }

    /// Bytes for the exact span, if cached.
    fn get(&self, run_id: u64, span: PageSpan) -> Option<Arc<Vec<u8>>> {
        let inner = self.inner.lock().ok()?;
        let bytes = inner.map.get(&(run_id, span.lo))?;
        // A stale entry for a shorter span must not satisfy a wider one.
        (bytes.len() >= span.len() * PAGE_SIZE).then(|| Arc::clone(bytes))
    }

    fn insert(&self, run_id: u64, span: PageSpan, bytes: &[u8]) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let key = (run_id, span.lo);
        if inner.map.contains_key(&key) {
            return;
        }
        let pages = bytes.len().div_ceil(PAGE_SIZE);
        inner.map.insert(key, Arc::new(bytes.to_vec()));
        inner.order.push_back(key);
        inner.pages_held += pages;
        while inner.pages_held > self.capacity_pages {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.map.remove(&oldest) {
                inner.pages_held -= evicted.len().div_ceil(PAGE_SIZE);
            }
        }
    }
}

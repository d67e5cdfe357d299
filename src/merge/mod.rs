//! Incremental merge — a stepped k-way merge of runs into a new run.
//!
//! A merge consumes an ordered list of input runs (earlier-listed runs
//! are *newer*) and produces one output run, advancing a bounded number
//! of entries per [`Merge::steps`] call so the caller can spread the
//! work across user operations.
//!
//! ## Resolution
//!
//! Entries for equal keys are folded newest-first with the monoidal
//! [`combine`](crate::entry::combine). A merge whose output lands at the
//! last level additionally elides `Delete` entries and converts
//! `Mupdate` into `Insert` — nothing below can observe either.
//!
//! ## Step accounting
//!
//! `steps(n)` consumes whole equal-key groups until at least `n` input
//! entries have been consumed, and reports exactly how many were. Summed
//! across calls, the reported counts equal the total entry count of the
//! inputs when the merge completes.
//!
//! ## Cancellation
//!
//! [`Merge::close`] (or dropping the merge) deletes the partial output
//! files and releases the references to the input runs; no output paths
//! remain on disk.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::StoreConfig;
use crate::entry::{Entry, Key, Resolve, combine, outcome_at_level};
use crate::error::StoreError;
use crate::run::builder::RunBuilder;
use crate::run::cursor::RunCursor;
use crate::run::{Run, RunPaths};

/// Whether the merge output lands at the last level of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// Levels below the output still hold data; deletes must persist.
    MidLevel,
    /// The output becomes the deepest data; deletes are elided.
    LastLevel,
}

/// Outcome of one [`Merge::steps`] call.
#[derive(Debug)]
pub enum StepResult {
    /// Inputs remain; call `steps` again.
    InProgress,
    /// All inputs are exhausted and the output run is finalized.
    /// The merge must not be stepped again.
    Complete(Arc<Run>),
}

struct HeapEntry {
    key: Key,
    entry: Entry,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// Min-heap by `(key ASC, source ASC)`: the smallest key pops first,
    /// and for equal keys the earliest-listed (newest) input pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.source.cmp(&other.source))
            .reverse()
    }
}

/// An in-progress merge of several runs into one.
pub struct Merge {
    inputs: Vec<Arc<Run>>,
    cursors: Vec<RunCursor>,
    heap: BinaryHeap<HeapEntry>,
    builder: Option<RunBuilder>,
    kind: MergeKind,
    resolve: Resolve,
    total_entries: u64,
    steps_done: u64,
    done: bool,
}

impl Merge {
    /// Creates a merge over `inputs`, or `None` when there is nothing to
    /// merge (zero or one input). Earlier-listed inputs are newer.
    pub fn new(
        config: &StoreConfig,
        kind: MergeKind,
        resolve: Resolve,
        paths: RunPaths,
        inputs: Vec<Arc<Run>>,
    ) -> Result<Option<Merge>, StoreError> {
        if inputs.len() < 2 {
            return Ok(None);
        }
        let total_entries: u64 = inputs.iter().map(|r| r.num_entries()).sum();
        let builder = RunBuilder::new(config, paths, total_entries as usize)?;

        let mut cursors = Vec::with_capacity(inputs.len());
        let mut heap = BinaryHeap::with_capacity(inputs.len());
        for (source, run) in inputs.iter().enumerate() {
            let mut cursor = RunCursor::new(Arc::clone(run))?;
            if let Some((key, entry)) = cursor.advance()? {
                heap.push(HeapEntry { key, entry, source });
            }
            cursors.push(cursor);
        }

        debug!(
            inputs = inputs.len(),
            total_entries,
            ?kind,
            "merge created"
        );
        Ok(Some(Merge {
            inputs,
            cursors,
            heap,
            builder: Some(builder),
            kind,
            resolve,
            total_entries,
            steps_done: 0,
            done: false,
        }))
    }

    /// The input runs, newest first. Lookups on a table consult these
    /// while the merge is in progress.
    pub fn input_runs(&self) -> &[Arc<Run>] {
        &self.inputs
    }

    /// Total step budget: the summed entry count of the inputs.
    pub fn total_entries(&self) -> u64 {
        self.total_entries
    }

    /// Advances the merge until at least `n` input entries have been
    /// consumed or the inputs are exhausted.
    ///
    /// Returns the number of entries actually consumed by this call and
    /// the merge status. Whole equal-key groups are always consumed
    /// together, so the count may slightly exceed `n`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::HandleClosed`] if called after the merge
    /// reported [`StepResult::Complete`].
    pub fn steps(&mut self, n: u64) -> Result<(u64, StepResult), StoreError> {
        if self.done {
            return Err(StoreError::HandleClosed);
        }
        let mut consumed = 0u64;
        while consumed < n {
            let Some(top) = self.heap.pop() else {
                self.steps_done += consumed;
                return Ok((consumed, self.finalize()?));
            };
            self.refill(top.source)?;

            // Gather every entry for this key, newest input first.
            let key = top.key;
            let mut acc = (top.entry, top.source);
            consumed += 1;
            while let Some(next) = self.heap.peek() {
                if next.key != key {
                    break;
                }
                let next = self.heap.pop().expect("peeked entry present");
                self.refill(next.source)?;
                consumed += 1;
                let (newer, source) = acc;
                // A blob only survives when the newer, absorbing entry
                // carries it, so the surviving span always points into
                // the run at `source`.
                acc = (combine(&self.resolve, newer, next.entry), source);
            }

            let (entry, source) = acc;
            if let Some(entry) = outcome_at_level(self.kind == MergeKind::LastLevel, entry) {
                let builder = self.builder.as_mut().expect("builder present until done");
                let entry = match entry {
                    Entry::InsertWithBlob(value, span) => {
                        let bytes = self.inputs[source].read_blob(span)?;
                        let span = builder.append_blob(&bytes)?;
                        Entry::InsertWithBlob(value, span)
                    }
                    other => other,
                };
                builder.add(key, entry)?;
            }
        }
        self.steps_done += consumed;
        trace!(consumed, total = self.steps_done, "merge stepped");
        Ok((consumed, StepResult::InProgress))
    }

    /// Cancels the merge: the partial output files are removed and the
    /// input references released.
    pub fn close(self) {
        // Dropping the builder unlinks the temporaries; dropping the
        // cursors and inputs releases the run references.
        debug!(steps_done = self.steps_done, "merge closed");
    }

    fn refill(&mut self, source: usize) -> Result<(), StoreError> {
        if let Some((key, entry)) = self.cursors[source].advance()? {
            self.heap.push(HeapEntry { key, entry, source });
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<StepResult, StoreError> {
        let builder = self.builder.take().expect("builder present until done");
        let run = Run::from_built(builder.finish()?)?;
        self.done = true;
        debug!(
            run_id = run.id(),
            entries = run.num_entries(),
            steps = self.steps_done,
            "merge complete"
        );
        Ok(StepResult::Complete(run))
    }
}

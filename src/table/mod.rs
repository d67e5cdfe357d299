//! Table — the level manager and credit-based merge scheduler.
//!
//! A table owns a write buffer and an ordered list of levels, level 0
//! newest. Updates land in the write buffer; when it reaches capacity it
//! is flushed to a level-0 run. When a level reaches its run bound, its
//! runs become the inputs of an incremental merge targeting the next
//! level, and every subsequent update pays a fixed number of merge steps
//! so the merge completes before the level overflows again.
//!
//! ## Concurrency
//!
//! All table state lives behind a single mutex cell. Operations acquire
//! the cell, perform their logical step, and release it; lookups clone
//! the run references they need and release the cell before touching
//! disk, which is safe because runs are immutable and reference-counted.
//!
//! ## Duplication
//!
//! [`Table::duplicate`] clones the level structure by reference: the new
//! table shares every existing run with the original, and the two evolve
//! independently afterwards. An in-progress merge stays with the
//! original; the duplicate sees the merge's inputs as ordinary runs.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::config::CachePolicy;
use crate::entry::{Entry, Key, Resolve, Value, combine};
use crate::error::StoreError;
use crate::lookup::{self, PageCache};
use crate::merge::{Merge, MergeKind, StepResult};
use crate::run::Run;
use crate::run::cursor::RunCursor;
use crate::run::page::MAX_KEY_LEN;
use crate::session::{SessionShared, SnapshotName};
use crate::write_buffer::{RawEntry, WriteBuffer};

/// One level of the tree: newly arrived runs plus at most one in-progress
/// merge whose output is destined for the next level.
#[derive(Default)]
struct Level {
    /// Runs not yet handed to a merge, newest first.
    incoming: Vec<Arc<Run>>,
    merge: Option<ScheduledMerge>,
}

struct ScheduledMerge {
    merge: Merge,
    /// Steps paid by each subsequent update: ⌈budget / slack⌉.
    per_update_steps: u64,
}

struct TableState {
    closed: bool,
    resolve: Resolve,
    wb: WriteBuffer,
    levels: Vec<Level>,
}

/// A handle to one LSM table. Cloning the handle shares the table;
/// [`Table::duplicate`] creates an independent copy.
#[derive(Clone)]
pub struct Table {
    session: Arc<SessionShared>,
    cell: Arc<Mutex<TableState>>,
    cache: Option<Arc<PageCache>>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").finish_non_exhaustive()
    }
}

impl Table {
    pub(crate) fn create(session: Arc<SessionShared>, resolve: Resolve) -> Table {
        Self::from_levels(session, resolve, Vec::new())
    }

    pub(crate) fn from_levels(
        session: Arc<SessionShared>,
        resolve: Resolve,
        levels: Vec<Vec<Arc<Run>>>,
    ) -> Table {
        let cache = match session.config().cache_policy {
            CachePolicy::CacheRunData => {
                Some(Arc::new(PageCache::new(session.config().page_cache_pages)))
            }
            CachePolicy::NoCacheRunData => None,
        };
        let levels = levels
            .into_iter()
            .map(|incoming| Level {
                incoming,
                merge: None,
            })
            .collect();
        Table {
            session,
            cell: Arc::new(Mutex::new(TableState {
                closed: false,
                resolve,
                wb: WriteBuffer::empty(),
                levels,
            })),
            cache,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, TableState>, StoreError> {
        if self.session.is_closed() {
            return Err(StoreError::HandleClosed);
        }
        let guard = self
            .cell
            .lock()
            .map_err(|_| StoreError::Corruption("table cell poisoned".into()))?;
        if guard.closed {
            return Err(StoreError::HandleClosed);
        }
        Ok(guard)
    }

    // --------------------------------------------------------------------------------------------
    // Updates
    // --------------------------------------------------------------------------------------------

    /// Inserts a key/value pair, replacing any previous entry.
    pub fn insert(&self, key: Key, value: Value) -> Result<(), StoreError> {
        self.update(key, Entry::Insert(value))
    }

    /// Inserts a key/value pair with an out-of-line blob payload.
    pub fn insert_with_blob(&self, key: Key, value: Value, blob: Vec<u8>) -> Result<(), StoreError> {
        self.update(key, Entry::InsertWithBlob(value, blob))
    }

    /// Deletes a key.
    pub fn delete(&self, key: Key) -> Result<(), StoreError> {
        self.update(key, Entry::Delete)
    }

    /// Monoidal upsert: combines with the current value via the table's
    /// resolve function.
    pub fn mupsert(&self, key: Key, value: Value) -> Result<(), StoreError> {
        self.update(key, Entry::Mupdate(value))
    }

    /// Applies a batch of updates in order. Each update contributes one
    /// unit of merge credit, exactly as the single-update operations do.
    pub fn updates(&self, batch: Vec<(Key, RawEntry)>) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        for (key, entry) in batch {
            apply_update(&mut state, &self.session, key, entry)?;
        }
        Ok(())
    }

    fn update(&self, key: Key, entry: RawEntry) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        apply_update(&mut state, &self.session, key, entry)
    }

    // --------------------------------------------------------------------------------------------
    // Lookups
    // --------------------------------------------------------------------------------------------

    /// Looks up the current value for a key.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Value>, StoreError> {
        Ok(self.lookup_full(key)?.map(|(value, _)| value))
    }

    /// Looks up a key, also materializing its blob payload if one is
    /// attached.
    pub fn lookup_with_blob(&self, key: &[u8]) -> Result<Option<(Value, Option<Vec<u8>>)>, StoreError> {
        self.lookup_full(key)
    }

    /// Batched point lookups; results come back in input order.
    pub fn lookup_batch(&self, keys: &[Key]) -> Result<Vec<Option<Value>>, StoreError> {
        let (wb_entries, runs, resolve) = {
            let state = self.lock()?;
            let wb_entries: Vec<Option<RawEntry>> =
                keys.iter().map(|k| state.wb.get(k).cloned()).collect();
            (wb_entries, collect_runs(&state), state.resolve.clone())
        };

        let raw = lookup::lookups_raw(
            self.session.config().batch_size,
            self.cache.as_deref(),
            keys,
            &runs,
            &resolve,
        )?;

        let mut out = Vec::with_capacity(keys.len());
        for (wb_entry, from_runs) in wb_entries.into_iter().zip(raw) {
            out.push(resolve_with_buffer(&resolve, wb_entry, from_runs).map(|(v, _)| v));
        }
        Ok(out)
    }

    fn lookup_full(&self, key: &[u8]) -> Result<Option<(Value, Option<Vec<u8>>)>, StoreError> {
        let (wb_entry, runs, resolve) = {
            let state = self.lock()?;
            (state.wb.get(key).cloned(), collect_runs(&state), state.resolve.clone())
        };

        // An absorbing buffer entry settles the lookup without touching
        // any run.
        if let Some(entry) = &wb_entry {
            match entry {
                Entry::Insert(v) => return Ok(Some((v.clone(), None))),
                Entry::InsertWithBlob(v, blob) => {
                    return Ok(Some((v.clone(), Some(blob.clone()))));
                }
                Entry::Delete => return Ok(None),
                Entry::Mupdate(_) => {}
            }
        }

        let keys = [key.to_vec()];
        let raw = lookup::lookups_raw(
            self.session.config().batch_size,
            self.cache.as_deref(),
            &keys,
            &runs,
            &resolve,
        )?
        .pop()
        .unwrap_or(None);

        match resolve_with_buffer(&resolve, wb_entry, raw) {
            None => Ok(None),
            Some((value, None)) => Ok(Some((value, None))),
            Some((value, Some((run_ix, span)))) => {
                let blob = runs[run_ix].read_blob(span)?;
                Ok(Some((value, Some(blob))))
            }
        }
    }

    /// Ordered range lookup over `[lo, hi)`, deletes elided.
    pub fn range(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Key, Value)>, StoreError> {
        if lo >= hi {
            return Ok(Vec::new());
        }
        let (wb_slice, runs, resolve) = {
            let state = self.lock()?;
            let wb_slice: Vec<(Key, Entry<()>)> = state
                .wb
                .range(lo, hi)
                .map(|(k, e)| (k.clone(), e.clone().map_blob(|_| ())))
                .collect();
            (wb_slice, collect_runs(&state), state.resolve.clone())
        };

        let mut sources: Vec<RangeSource> = Vec::with_capacity(runs.len() + 1);
        sources.push(RangeSource::from_buffer(wb_slice));
        for run in &runs {
            sources.push(RangeSource::from_run(Arc::clone(run), lo)?);
        }

        let mut out = Vec::new();
        loop {
            // Smallest current key across sources; earlier sources are
            // newer and win ties.
            let Some(key) = sources
                .iter()
                .filter_map(|s| s.peek_key())
                .min()
                .map(<[u8]>::to_vec)
            else {
                break;
            };
            if key.as_slice() >= hi {
                break;
            }
            let mut acc: Option<Entry<()>> = None;
            for source in &mut sources {
                if source.peek_key() != Some(key.as_slice()) {
                    continue;
                }
                let entry = source.advance()?;
                acc = Some(match acc {
                    None => entry,
                    Some(newer) => {
                        if matches!(newer, Entry::Mupdate(_)) {
                            combine(&resolve, newer, entry)
                        } else {
                            newer
                        }
                    }
                });
            }
            match acc {
                Some(Entry::Insert(v))
                | Some(Entry::InsertWithBlob(v, ()))
                | Some(Entry::Mupdate(v)) => out.push((key, v)),
                Some(Entry::Delete) | None => {}
            }
        }
        Ok(out)
    }

    // --------------------------------------------------------------------------------------------
    // Duplication, union, snapshots
    // --------------------------------------------------------------------------------------------

    /// Creates an independent copy sharing all existing runs by
    /// reference and carrying a snapshot of the current write buffer.
    /// Subsequent updates to either table leave the other unchanged.
    pub fn duplicate(&self) -> Result<Table, StoreError> {
        let state = self.lock()?;
        let levels: Vec<Vec<Arc<Run>>> = state.levels.iter().map(level_run_refs).collect();
        debug!(levels = levels.len(), "table duplicated");
        let table = Table::from_levels(
            Arc::clone(&self.session),
            state.resolve.clone(),
            levels,
        );
        table.lock()?.wb = state.wb.clone();
        Ok(table)
    }

    /// Unions this table (newer) with `other` (older) into a new table
    /// sharing both inputs' runs. Fails with
    /// [`StoreError::DifferentSessions`] when the tables belong to
    /// different sessions.
    pub fn union(&self, other: &Table) -> Result<Table, StoreError> {
        if !Arc::ptr_eq(&self.session, &other.session) {
            return Err(StoreError::DifferentSessions);
        }
        if Arc::ptr_eq(&self.cell, &other.cell) {
            let state = self.lock()?;
            return self.build_union(&state, &state);
        }
        // Lock in address order so concurrent unions cannot deadlock;
        // `self` stays the newer side regardless of which locks first.
        if Arc::as_ptr(&self.cell) < Arc::as_ptr(&other.cell) {
            let left = self.lock()?;
            let right = other.lock()?;
            self.build_union(&left, &right)
        } else {
            let right = other.lock()?;
            let left = self.lock()?;
            self.build_union(&left, &right)
        }
    }

    fn build_union(&self, left: &TableState, right: &TableState) -> Result<Table, StoreError> {
        let resolve = left.resolve.clone();
        let wb = left.wb.clone().union(right.wb.clone(), &resolve);
        // Left levels first: every left run is consulted before any
        // right run, making the left table the newer of the two.
        let mut levels: Vec<Vec<Arc<Run>>> = left.levels.iter().map(level_run_refs).collect();
        levels.extend(right.levels.iter().map(level_run_refs));

        let table = Table::from_levels(Arc::clone(&self.session), resolve, levels);
        {
            let mut state = table.lock()?;
            state.wb = wb;
            // A combined level may already exceed the run bound.
            let mut lvl = 0;
            while lvl < state.levels.len() {
                if state.levels[lvl].incoming.len() >= self.session.config().level_run_bound {
                    schedule_merge(&mut state, &self.session, lvl)?;
                }
                lvl += 1;
            }
        }
        info!("tables unioned");
        Ok(table)
    }

    /// Registers the table's current content as a named snapshot.
    ///
    /// The write buffer is flushed first so the descriptor is pure runs;
    /// a previous snapshot of the same name is replaced. `type_tag`
    /// records the caller's key/value serialization so a later open can
    /// detect a mismatch.
    pub fn snapshot(&self, name: &str, type_tag: &str) -> Result<(), StoreError> {
        let name = SnapshotName::new(name)?;
        let mut state = self.lock()?;
        flush_write_buffer(&mut state, &self.session)?;
        let levels: Vec<Vec<Arc<Run>>> = state.levels.iter().map(level_run_refs).collect();
        self.session
            .register_snapshot(name.clone(), levels, state.resolve.clone(), type_tag)?;
        info!(name = name.as_str(), "snapshot registered");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Introspection and shutdown
    // --------------------------------------------------------------------------------------------

    /// Fully reconstructs the observed key/value mapping. Intended for
    /// testing; materializes the whole table.
    pub fn logical_value(&self) -> Result<BTreeMap<Key, Value>, StoreError> {
        let (wb, runs, resolve) = {
            let state = self.lock()?;
            (state.wb.clone(), collect_runs(&state), state.resolve.clone())
        };

        let mut acc: BTreeMap<Key, Entry<()>> = BTreeMap::new();
        // Oldest source first, so each newer entry resolves over the
        // accumulated older one.
        for run in runs.iter().rev() {
            let mut cursor = RunCursor::new(Arc::clone(run))?;
            while let Some((key, entry)) = cursor.advance()? {
                fold_newest(&mut acc, &resolve, key, entry.map_blob(|_| ()));
            }
        }
        for (key, entry) in wb.iter() {
            fold_newest(&mut acc, &resolve, key.clone(), entry.clone().map_blob(|_| ()));
        }

        let map = acc
            .into_iter()
            .filter_map(|(k, e)| match e {
                Entry::Insert(v) | Entry::InsertWithBlob(v, ()) | Entry::Mupdate(v) => Some((k, v)),
                Entry::Delete => None,
            })
            .collect();
        Ok(map)
    }

    /// Total number of live runs across all levels.
    pub fn num_runs(&self) -> Result<usize, StoreError> {
        let state = self.lock()?;
        Ok(collect_runs(&state).len())
    }

    /// Closes the table: in-progress merges are cancelled (their partial
    /// outputs removed) and all run references released. Subsequent
    /// operations fail with [`StoreError::HandleClosed`].
    pub fn close(&self) -> Result<(), StoreError> {
        let mut guard = self
            .cell
            .lock()
            .map_err(|_| StoreError::Corruption("table cell poisoned".into()))?;
        if guard.closed {
            return Ok(());
        }
        guard.closed = true;
        guard.wb = WriteBuffer::empty();
        for level in guard.levels.drain(..) {
            if let Some(sm) = level.merge {
                sm.merge.close();
            }
        }
        info!("table closed");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Update path and merge scheduling
// ------------------------------------------------------------------------------------------------

fn apply_update(
    state: &mut TableState,
    session: &Arc<SessionShared>,
    key: Key,
    entry: RawEntry,
) -> Result<(), StoreError> {
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::KeyTooLarge {
            len: key.len(),
            max: MAX_KEY_LEN,
        });
    }
    let resolve = state.resolve.clone();
    state.wb.insert(key, entry, &resolve);
    supply_credit(state, session, 1)?;
    if state.wb.num_entries() >= session.config().write_buffer_entries {
        flush_write_buffer(state, session)?;
    }
    Ok(())
}

/// Pays `units` credits to every in-progress merge, installing outputs
/// of any merge that completes.
fn supply_credit(
    state: &mut TableState,
    session: &Arc<SessionShared>,
    units: u64,
) -> Result<(), StoreError> {
    let mut lvl = 0;
    while lvl < state.levels.len() {
        let Some(sm) = state.levels[lvl].merge.as_mut() else {
            lvl += 1;
            continue;
        };
        let steps = sm.per_update_steps.saturating_mul(units);
        let (_, status) = sm.merge.steps(steps)?;
        if let StepResult::Complete(run) = status {
            state.levels[lvl].merge = None;
            install_run(state, session, lvl + 1, run)?;
        }
        lvl += 1;
    }
    Ok(())
}

fn flush_write_buffer(
    state: &mut TableState,
    session: &Arc<SessionShared>,
) -> Result<(), StoreError> {
    if state.wb.is_empty() {
        return Ok(());
    }
    let wb = std::mem::take(&mut state.wb);
    let paths = session.new_run_paths();
    let run = Run::from_write_buffer(session.config(), paths, &wb)?;
    debug!(run_id = run.id(), entries = run.num_entries(), "write buffer flushed");
    install_run(state, session, 0, run)
}

/// Installs a run at the front of a level, creating the level if needed
/// and scheduling a merge when the level reaches its bound. Empty runs
/// are dropped on the spot.
fn install_run(
    state: &mut TableState,
    session: &Arc<SessionShared>,
    lvl: usize,
    run: Arc<Run>,
) -> Result<(), StoreError> {
    if run.num_entries() == 0 {
        return Ok(());
    }
    while state.levels.len() <= lvl {
        state.levels.push(Level::default());
    }
    state.levels[lvl].incoming.insert(0, run);
    if state.levels[lvl].incoming.len() >= session.config().level_run_bound {
        schedule_merge(state, session, lvl)?;
    }
    Ok(())
}

/// Hands a full level's runs to a new merge targeting the next level.
///
/// At most one merge runs per level: if the previous merge is still in
/// progress when the level refills (the slack estimate was beaten), it
/// is driven to completion synchronously first.
fn schedule_merge(
    state: &mut TableState,
    session: &Arc<SessionShared>,
    lvl: usize,
) -> Result<(), StoreError> {
    if state.levels[lvl].merge.is_some() {
        complete_level_merge(state, session, lvl)?;
    }

    let inputs = std::mem::take(&mut state.levels[lvl].incoming);
    if inputs.len() < 2 {
        // Nothing to merge; a lone run moves straight down.
        for run in inputs {
            install_run(state, session, lvl + 1, run)?;
        }
        return Ok(());
    }

    let kind = if is_last_level(state, lvl) {
        MergeKind::LastLevel
    } else {
        MergeKind::MidLevel
    };
    let paths = session.new_run_paths();
    let resolve = state.resolve.clone();
    let Some(merge) = Merge::new(session.config(), kind, resolve, paths, inputs)? else {
        return Ok(());
    };

    let budget = merge.total_entries();
    let slack = credit_slack(session, lvl);
    let per_update_steps = budget.div_ceil(slack).max(1);
    debug!(lvl, budget, slack, per_update_steps, ?kind, "merge scheduled");
    state.levels[lvl].merge = Some(ScheduledMerge {
        merge,
        per_update_steps,
    });
    Ok(())
}

/// Updates expected before level `lvl` holds a full complement of runs
/// again: one write-buffer flush per `write_buffer_entries` updates,
/// amplified by the run bound per level descended.
fn credit_slack(session: &Arc<SessionShared>, lvl: usize) -> u64 {
    let config = session.config();
    let mut slack = config.write_buffer_entries as u64;
    for _ in 0..=lvl {
        slack = slack.saturating_mul(config.level_run_bound as u64);
    }
    slack.max(1)
}

fn complete_level_merge(
    state: &mut TableState,
    session: &Arc<SessionShared>,
    lvl: usize,
) -> Result<(), StoreError> {
    let Some(mut sm) = state.levels[lvl].merge.take() else {
        return Ok(());
    };
    debug!(lvl, "forcing in-progress merge to completion");
    loop {
        let (_, status) = sm.merge.steps(u64::MAX)?;
        if let StepResult::Complete(run) = status {
            return install_run(state, session, lvl + 1, run);
        }
    }
}

/// A merge created at `lvl` feeds the last level exactly when no deeper
/// level holds data.
fn is_last_level(state: &TableState, lvl: usize) -> bool {
    state.levels[lvl + 1..]
        .iter()
        .all(|level| level.incoming.is_empty() && level.merge.is_none())
}

/// All live runs, newest first: per level, the freshly arrived runs and
/// then the inputs of the level's in-progress merge.
fn collect_runs(state: &TableState) -> Vec<Arc<Run>> {
    let mut runs = Vec::new();
    for level in &state.levels {
        runs.extend(level.incoming.iter().cloned());
        if let Some(sm) = &level.merge {
            runs.extend(sm.merge.input_runs().iter().cloned());
        }
    }
    runs
}

/// The level's run references, newest first, merge inputs flattened in.
fn level_run_refs(level: &Level) -> Vec<Arc<Run>> {
    let mut runs = level.incoming.clone();
    if let Some(sm) = &level.merge {
        runs.extend(sm.merge.input_runs().iter().cloned());
    }
    runs
}

/// Resolves a write-buffer entry (newest) over the runs' resolved entry.
///
/// Returns the final value plus, when the winning entry carries a blob
/// from a run, that run's index and the span.
#[allow(clippy::type_complexity)]
fn resolve_with_buffer(
    resolve: &Resolve,
    wb_entry: Option<RawEntry>,
    from_runs: Option<(Entry, usize)>,
) -> Option<(Value, Option<(usize, crate::entry::BlobSpan)>)> {
    match wb_entry {
        Some(Entry::Insert(v)) => Some((v, None)),
        // The raw blob is only reachable through `lookup_full`, which
        // short-circuits before calling here; treat it as inline.
        Some(Entry::InsertWithBlob(v, _)) => Some((v, None)),
        Some(Entry::Delete) => None,
        Some(Entry::Mupdate(v)) => match from_runs {
            None | Some((Entry::Delete, _)) => Some((v, None)),
            Some((Entry::Insert(u), _))
            | Some((Entry::InsertWithBlob(u, _), _))
            | Some((Entry::Mupdate(u), _)) => Some((resolve(&v, &u), None)),
        },
        None => match from_runs {
            None | Some((Entry::Delete, _)) => None,
            Some((Entry::Insert(v), _)) | Some((Entry::Mupdate(v), _)) => Some((v, None)),
            Some((Entry::InsertWithBlob(v, span), run_ix)) => Some((v, Some((run_ix, span)))),
        },
    }
}

fn fold_newest(
    acc: &mut BTreeMap<Key, Entry<()>>,
    resolve: &Resolve,
    key: Key,
    newer: Entry<()>,
) {
    match acc.remove(&key) {
        None => {
            acc.insert(key, newer);
        }
        Some(older) => {
            acc.insert(key, combine(resolve, newer, older));
        }
    }
}

// ------------------------------------------------------------------------------------------------
// RangeSource — one stream feeding the range merge
// ------------------------------------------------------------------------------------------------

enum RangeSourceInner {
    Buffer(std::vec::IntoIter<(Key, Entry<()>)>),
    Run(RunCursor),
}

struct RangeSource {
    inner: RangeSourceInner,
    current: Option<(Key, Entry<()>)>,
}

impl RangeSource {
    fn from_buffer(entries: Vec<(Key, Entry<()>)>) -> Self {
        let mut iter = entries.into_iter();
        let current = iter.next();
        Self {
            inner: RangeSourceInner::Buffer(iter),
            current,
        }
    }

    fn from_run(run: Arc<Run>, lo: &[u8]) -> Result<Self, StoreError> {
        let mut cursor = RunCursor::seek(run, lo)?;
        let current = cursor.advance()?.map(|(k, e)| (k, e.map_blob(|_| ())));
        Ok(Self {
            inner: RangeSourceInner::Run(cursor),
            current,
        })
    }

    fn peek_key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(k, _)| k.as_slice())
    }

    /// Consumes the current entry and pre-loads the next one.
    fn advance(&mut self) -> Result<Entry<()>, StoreError> {
        let (_, entry) = self.current.take().expect("advance past end of range source");
        self.current = match &mut self.inner {
            RangeSourceInner::Buffer(iter) => iter.next(),
            RangeSourceInner::Run(cursor) => {
                cursor.advance()?.map(|(k, e)| (k, e.map_blob(|_| ())))
            }
        };
        Ok(entry)
    }
}

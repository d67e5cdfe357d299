//! Integration tests for the public `Session`/`Table` API.
//!
//! These tests exercise the full engine (write buffer → runs → scheduled
//! merges → lookups) through the public `stratumdb::{Session, StoreConfig,
//! StoreError}` surface only. No internal modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: session open/close, table close, idempotent close,
//!   closed-handle errors
//! - **CRUD**: insert, lookup, delete, overwrite, nonexistent keys
//! - **Monoidal upserts**: chains within the buffer and across flushes
//! - **Blobs**: out-of-line payloads round-trip through runs
//! - **Range**: ordered scans across the buffer and runs, bound handling
//! - **Duplication**: O(1) copies are independent both ways
//! - **Union**: left-biased combination of two tables
//! - **Snapshots**: freeze, reopen, type tags, name validation
//! - **Concurrency**: multi-thread writers on one table, readers during
//!   writes
//! - **Full-stack**: randomized workload checked against a model map
//!
//! ## See also
//! - `run::tests` — page, filter, index, and builder unit tests
//! - `merge::tests` — step accounting, distributivity, cancellation
//! - `table::tests` — scheduler-level unit tests

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use rand::Rng;
use stratumdb::{Entry, Resolve, Session, StoreConfig, StoreError};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// `⊕` = byte concatenation appending the newer value after the older
/// one, so a chain of mupserts reads in application order.
fn concat_resolve() -> Resolve {
    Arc::new(|new: &[u8], old: &[u8]| {
        let mut v = old.to_vec();
        v.extend_from_slice(new);
        v
    })
}

/// Tiny capacities so a handful of updates exercises flushes, merges,
/// and level cascades.
fn small_buffer_config() -> StoreConfig {
    StoreConfig {
        write_buffer_entries: 4,
        level_run_bound: 2,
        range_finder_precision: 8,
        chunk_size: 4,
        ..StoreConfig::default()
    }
}

// ================================================================================================
// Lifecycle
// ================================================================================================

/// # Scenario
/// Open a fresh session, create a table, and close both.
///
/// # Expected behavior
/// All four operations succeed without error.
#[test]
fn open_close_empty() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), StoreConfig::default()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();
    table.close().unwrap();
    session.close().unwrap();
}

/// # Scenario
/// Calling `Table::close` twice must not panic or return an error.
///
/// # Expected behavior
/// Both calls return `Ok(())`; operations after the first close fail
/// with `HandleClosed`.
#[test]
fn table_close_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), StoreConfig::default()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();

    table.close().unwrap();
    table.close().unwrap();
    assert!(matches!(
        table.insert(b"k".to_vec(), b"v".to_vec()),
        Err(StoreError::HandleClosed)
    ));
}

/// # Scenario
/// Closing the session invalidates every handle created through it.
///
/// # Expected behavior
/// The table and the session itself reject further operations with
/// `HandleClosed`.
#[test]
fn session_close_invalidates_tables() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), StoreConfig::default()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();
    table.insert(b"k".to_vec(), b"v".to_vec()).unwrap();

    session.close().unwrap();
    assert!(matches!(table.lookup(b"k"), Err(StoreError::HandleClosed)));
    assert!(matches!(
        session.new_table(concat_resolve()),
        Err(StoreError::HandleClosed)
    ));
}

// ================================================================================================
// CRUD
// ================================================================================================

/// # Scenario
/// Insert two pairs, look up a present key and an absent one.
///
/// # Expected behavior
/// `"k1"` resolves to `"v1"`; `"k3"` is not found.
#[test]
fn insert_and_lookup() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), StoreConfig::default()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();

    table.insert(b"k1".to_vec(), b"v1".to_vec()).unwrap();
    table.insert(b"k2".to_vec(), b"v2".to_vec()).unwrap();

    assert_eq!(table.lookup(b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(table.lookup(b"k3").unwrap(), None);
}

/// # Scenario
/// Delete a key that was inserted earlier, then keep writing so the
/// tombstone travels through flushes and merges to the last level.
///
/// # Expected behavior
/// The key stays absent at every point, and the final logical value
/// holds no entry for it.
#[test]
fn delete_over_insert_survives_compaction() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), small_buffer_config()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();

    table.insert(b"a".to_vec(), b"1".to_vec()).unwrap();
    table.delete(b"a".to_vec()).unwrap();
    assert_eq!(table.lookup(b"a").unwrap(), None);

    for i in 0u32..64 {
        table.insert(i.to_be_bytes().to_vec(), b"x".to_vec()).unwrap();
        assert_eq!(table.lookup(b"a").unwrap(), None);
    }
    assert!(!table.logical_value().unwrap().contains_key(&b"a".to_vec()));
}

/// # Scenario
/// Overwrite the same key many times across flush boundaries.
///
/// # Expected behavior
/// Only the last value survives.
#[test]
fn overwrite_keeps_newest() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), small_buffer_config()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();

    for round in 0u32..40 {
        table.insert(b"hot".to_vec(), round.to_be_bytes().to_vec()).unwrap();
        table.insert(round.to_be_bytes().to_vec(), b"filler".to_vec()).unwrap();
    }
    assert_eq!(table.lookup(b"hot").unwrap(), Some(39u32.to_be_bytes().to_vec()));
}

/// # Scenario
/// Apply a batch of mixed updates in one `updates` call.
///
/// # Expected behavior
/// The batch applies in order: the later delete wins over the earlier
/// insert of `"a"`.
#[test]
fn batched_updates_apply_in_order() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), StoreConfig::default()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();

    table
        .updates(vec![
            (b"a".to_vec(), Entry::Insert(b"1".to_vec())),
            (b"b".to_vec(), Entry::Insert(b"2".to_vec())),
            (b"a".to_vec(), Entry::Delete),
        ])
        .unwrap();

    let results = table.lookup_batch(&[b"a".to_vec(), b"b".to_vec()]).unwrap();
    assert_eq!(results, vec![None, Some(b"2".to_vec())]);
}

// ================================================================================================
// Monoidal upserts
// ================================================================================================

/// # Scenario
/// Three mupserts to the same key with `⊕` = concatenation.
///
/// # Expected behavior
/// The lookup returns the fold in application order: `"xyz"`.
#[test]
fn mupsert_chain_in_buffer() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), StoreConfig::default()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();

    table.mupsert(b"k".to_vec(), b"x".to_vec()).unwrap();
    table.mupsert(b"k".to_vec(), b"y".to_vec()).unwrap();
    table.mupsert(b"k".to_vec(), b"z".to_vec()).unwrap();

    assert_eq!(table.lookup(b"k").unwrap(), Some(b"xyz".to_vec()));
}

/// # Scenario
/// The same chain, but filler writes force a flush between the links so
/// each mupsert lands in a different run.
///
/// # Expected behavior
/// The cross-run fold produces the same `"abc"` a buffered chain would.
#[test]
fn mupsert_chain_across_flushes() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), small_buffer_config()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();

    for (i, piece) in [&b"a"[..], b"b", b"c"].iter().enumerate() {
        table.mupsert(b"k".to_vec(), piece.to_vec()).unwrap();
        for j in 0u32..4 {
            let filler = (i as u32 * 100 + j).to_be_bytes().to_vec();
            table.insert(filler, b"f".to_vec()).unwrap();
        }
    }
    assert_eq!(table.lookup(b"k").unwrap(), Some(b"abc".to_vec()));
}

/// # Scenario
/// Mupsert over a delete, and over a plain insert.
///
/// # Expected behavior
/// Over a delete the mupsert acts as an insert; over an insert it
/// combines with the stored value.
#[test]
fn mupsert_resolution_rules() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), StoreConfig::default()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();

    table.insert(b"k".to_vec(), b"base".to_vec()).unwrap();
    table.mupsert(b"k".to_vec(), b"+more".to_vec()).unwrap();
    assert_eq!(table.lookup(b"k").unwrap(), Some(b"base+more".to_vec()));

    table.delete(b"k".to_vec()).unwrap();
    table.mupsert(b"k".to_vec(), b"fresh".to_vec()).unwrap();
    assert_eq!(table.lookup(b"k").unwrap(), Some(b"fresh".to_vec()));
}

// ================================================================================================
// Blobs
// ================================================================================================

/// # Scenario
/// Insert a value with an out-of-line blob, then push it into a run and
/// read it back.
///
/// # Expected behavior
/// `lookup_with_blob` returns the inline value and the full blob both
/// before and after the flush; plain `lookup` returns just the value.
#[test]
fn blob_round_trip() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), small_buffer_config()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();

    let blob = vec![0xBB; 5000];
    table
        .insert_with_blob(b"k".to_vec(), b"v".to_vec(), blob.clone())
        .unwrap();
    assert_eq!(
        table.lookup_with_blob(b"k").unwrap(),
        Some((b"v".to_vec(), Some(blob.clone())))
    );

    for i in 0u32..8 {
        table.insert(i.to_be_bytes().to_vec(), b"f".to_vec()).unwrap();
    }
    assert_eq!(
        table.lookup_with_blob(b"k").unwrap(),
        Some((b"v".to_vec(), Some(blob)))
    );
    assert_eq!(table.lookup(b"k").unwrap(), Some(b"v".to_vec()));
}

// ================================================================================================
// Range
// ================================================================================================

/// # Scenario
/// Scan `[lo, hi)` over a table whose entries are split between the
/// write buffer and several runs.
///
/// # Expected behavior
/// Keys come back ordered and deduplicated with the newest value; the
/// lower bound is inclusive, the upper exclusive.
#[test]
fn range_scan_across_buffer_and_runs() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), small_buffer_config()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();

    for i in 0u32..30 {
        table.insert(i.to_be_bytes().to_vec(), b"old".to_vec()).unwrap();
    }
    // Rewrite a few keys; some rewrites stay buffered.
    for i in [5u32, 6, 7] {
        table.insert(i.to_be_bytes().to_vec(), b"new".to_vec()).unwrap();
    }

    let result = table.range(&5u32.to_be_bytes(), &9u32.to_be_bytes()).unwrap();
    let keys: Vec<u32> = result
        .iter()
        .map(|(k, _)| u32::from_be_bytes(k.as_slice().try_into().unwrap()))
        .collect();
    assert_eq!(keys, vec![5, 6, 7, 8]);
    assert_eq!(result[0].1, b"new".to_vec());
    assert_eq!(result[3].1, b"old".to_vec());

    assert!(table.range(&9u32.to_be_bytes(), &9u32.to_be_bytes()).unwrap().is_empty());
}

/// # Scenario
/// Delete a key in the middle of a scanned range.
///
/// # Expected behavior
/// The deleted key is elided from the scan even while its tombstone is
/// still the newest entry.
#[test]
fn range_scan_elides_deletes() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), small_buffer_config()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();

    for key in [&b"a"[..], b"b", b"c"] {
        table.insert(key.to_vec(), b"v".to_vec()).unwrap();
    }
    for i in 0u32..8 {
        table.insert(i.to_be_bytes().to_vec(), b"f".to_vec()).unwrap();
    }
    table.delete(b"b".to_vec()).unwrap();

    let keys: Vec<Vec<u8>> = table
        .range(b"a", b"d")
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);
}

// ================================================================================================
// Duplication and union
// ================================================================================================

/// # Scenario
/// Duplicate a table that holds both flushed runs and buffered updates,
/// then update each side.
///
/// # Expected behavior
/// The duplicate starts with the exact content of the original —
/// including entries still in the write buffer — and the two evolve
/// independently afterwards.
#[test]
fn duplicate_is_independent_both_ways() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), small_buffer_config()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();

    // 10 inserts with a 4-entry buffer: 8 flushed, 2 still buffered.
    for i in 0u32..10 {
        table.insert(i.to_be_bytes().to_vec(), b"orig".to_vec()).unwrap();
    }
    let before = table.logical_value().unwrap();

    let copy = table.duplicate().unwrap();
    assert_eq!(copy.logical_value().unwrap(), before);

    copy.insert(b"copy-only".to_vec(), b"c".to_vec()).unwrap();
    copy.delete(0u32.to_be_bytes().to_vec()).unwrap();
    assert_eq!(table.logical_value().unwrap(), before);

    let copy_state = copy.logical_value().unwrap();
    table.insert(b"orig-only".to_vec(), b"o".to_vec()).unwrap();
    assert_eq!(copy.logical_value().unwrap(), copy_state);
}

/// # Scenario
/// Union two tables that disagree on a key.
///
/// # Expected behavior
/// The left (newer) table wins the conflict; keys unique to either side
/// are all present; the inputs are untouched.
#[test]
fn union_is_left_biased() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), StoreConfig::default()).unwrap();
    let left = session.new_table(concat_resolve()).unwrap();
    let right = session.new_table(concat_resolve()).unwrap();

    left.insert(b"shared".to_vec(), b"left".to_vec()).unwrap();
    left.insert(b"l".to_vec(), b"1".to_vec()).unwrap();
    right.insert(b"shared".to_vec(), b"right".to_vec()).unwrap();
    right.insert(b"r".to_vec(), b"2".to_vec()).unwrap();

    let combined = left.union(&right).unwrap();
    assert_eq!(combined.lookup(b"shared").unwrap(), Some(b"left".to_vec()));
    assert_eq!(combined.lookup(b"l").unwrap(), Some(b"1".to_vec()));
    assert_eq!(combined.lookup(b"r").unwrap(), Some(b"2".to_vec()));

    combined.delete(b"l".to_vec()).unwrap();
    assert_eq!(left.lookup(b"l").unwrap(), Some(b"1".to_vec()));
}

/// # Scenario
/// Union two tables opened from different sessions.
///
/// # Expected behavior
/// Rejected with `DifferentSessions`.
#[test]
fn union_across_sessions_is_rejected() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let session_a = Session::open(dir_a.path(), StoreConfig::default()).unwrap();
    let session_b = Session::open(dir_b.path(), StoreConfig::default()).unwrap();
    let table_a = session_a.new_table(concat_resolve()).unwrap();
    let table_b = session_b.new_table(concat_resolve()).unwrap();

    assert!(matches!(
        table_a.union(&table_b),
        Err(StoreError::DifferentSessions)
    ));
}

// ================================================================================================
// Snapshots
// ================================================================================================

/// # Scenario
/// Insert batch B₁, snapshot as `"s"`, insert batch B₂, then reopen the
/// snapshot.
///
/// # Expected behavior
/// The reopened table sees exactly B₁; updates on it do not leak back.
#[test]
fn snapshot_freezes_content() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), small_buffer_config()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();

    for i in 0u32..12 {
        table.insert(i.to_be_bytes().to_vec(), b"b1".to_vec()).unwrap();
    }
    let b1 = table.logical_value().unwrap();
    table.snapshot("s", "bytes").unwrap();

    for i in 12u32..24 {
        table.insert(i.to_be_bytes().to_vec(), b"b2".to_vec()).unwrap();
    }
    table.delete(0u32.to_be_bytes().to_vec()).unwrap();

    let frozen = session.open_snapshot("s", "bytes").unwrap();
    assert_eq!(frozen.logical_value().unwrap(), b1);

    frozen.insert(b"in-snapshot".to_vec(), b"x".to_vec()).unwrap();
    assert_eq!(table.lookup(b"in-snapshot").unwrap(), None);
}

/// # Scenario
/// Open a snapshot under a different type tag, an unknown name, and an
/// invalid name.
///
/// # Expected behavior
/// `SnapshotTypeMismatch`, `NoSuchSnapshot`, and `InvalidSnapshotName`
/// respectively.
#[test]
fn snapshot_open_failure_modes() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), StoreConfig::default()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();
    table.snapshot("typed", "string-keys").unwrap();

    assert!(matches!(
        session.open_snapshot("typed", "int-keys"),
        Err(StoreError::SnapshotTypeMismatch { .. })
    ));
    assert!(matches!(
        session.open_snapshot("missing", "bytes"),
        Err(StoreError::NoSuchSnapshot(_))
    ));
    assert!(matches!(
        session.open_snapshot("Not Valid", "bytes"),
        Err(StoreError::InvalidSnapshotName(_))
    ));
    assert!(matches!(
        table.snapshot("Not Valid", "bytes"),
        Err(StoreError::InvalidSnapshotName(_))
    ));
}

// ================================================================================================
// Concurrency
// ================================================================================================

/// # Scenario
/// Eight threads write disjoint key ranges into one shared table.
///
/// # Expected behavior
/// Every written key is readable afterwards; nothing is lost to the
/// interleaved flushes and merge credit payments.
#[test]
fn concurrent_writers_lose_nothing() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), small_buffer_config()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();

    let mut handles = Vec::new();
    for t in 0u32..8 {
        let table = table.clone();
        handles.push(thread::spawn(move || {
            for i in 0u32..50 {
                let key = (t * 1000 + i).to_be_bytes().to_vec();
                table.insert(key, t.to_be_bytes().to_vec()).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0u32..8 {
        for i in 0u32..50 {
            let key = (t * 1000 + i).to_be_bytes();
            assert_eq!(
                table.lookup(&key).unwrap(),
                Some(t.to_be_bytes().to_vec()),
                "thread {t} key {i} lost"
            );
        }
    }
}

/// # Scenario
/// Readers run against the table while a writer churns it.
///
/// # Expected behavior
/// Reads never fail and always return either the old value or the new
/// one, never garbage.
#[test]
fn readers_during_writes() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), small_buffer_config()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();
    for i in 0u32..64 {
        table.insert(i.to_be_bytes().to_vec(), b"old".to_vec()).unwrap();
    }

    let writer = {
        let table = table.clone();
        thread::spawn(move || {
            for i in 0u32..64 {
                table.insert(i.to_be_bytes().to_vec(), b"new".to_vec()).unwrap();
            }
        })
    };

    let reader = {
        let table = table.clone();
        thread::spawn(move || {
            for _ in 0..4 {
                for i in 0u32..64 {
                    let got = table.lookup(&i.to_be_bytes()).unwrap();
                    assert!(
                        got == Some(b"old".to_vec()) || got == Some(b"new".to_vec()),
                        "key {i} returned {got:?}"
                    );
                }
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
}

// ================================================================================================
// Full-stack
// ================================================================================================

/// # Scenario
/// 800 random inserts, mupserts, and deletes over a 50-key space with a
/// tiny write buffer, mirrored into a `BTreeMap` model.
///
/// # Expected behavior
/// The table's logical value equals the model, and point lookups agree
/// with it for every key — the whole stack (resolution, flush, merge
/// scheduling, lookup pipeline) preserves the observable mapping.
#[test]
fn randomized_workload_matches_model() {
    let dir = TempDir::new().unwrap();
    let session = Session::open(dir.path(), small_buffer_config()).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();

    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = rand::rng();

    for _ in 0..800 {
        let key = vec![b'k', rng.random_range(0..50u8)];
        match rng.random_range(0..10u8) {
            0..=5 => {
                let value: Vec<u8> = (0..rng.random_range(1..16)).map(|_| rng.random()).collect();
                table.insert(key.clone(), value.clone()).unwrap();
                model.insert(key, value);
            }
            6..=7 => {
                let value = vec![rng.random::<u8>()];
                table.mupsert(key.clone(), value.clone()).unwrap();
                match model.remove(&key) {
                    None => {
                        model.insert(key, value);
                    }
                    Some(mut old) => {
                        old.extend_from_slice(&value);
                        model.insert(key, old);
                    }
                }
            }
            _ => {
                table.delete(key.clone()).unwrap();
                model.remove(&key);
            }
        }
    }

    assert_eq!(table.logical_value().unwrap(), model);
    for i in 0..50u8 {
        let key = vec![b'k', i];
        assert_eq!(table.lookup(&key).unwrap(), model.get(&key).cloned());
    }
}

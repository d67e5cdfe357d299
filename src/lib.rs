//! # StratumDB
//!
//! An embeddable, ordered key-value store engine organized as a
//! **Log-Structured Merge tree (LSM-tree)** with incremental,
//! credit-scheduled merges. Designed as a library core consumed by
//! higher-level services: keys and values are opaque byte sequences,
//! updates support inserts, deletes, and **monoidal upserts**, and
//! tables can be duplicated and snapshotted cheaply by sharing their
//! immutable on-disk runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                         Table                              │
//! │  ┌─────────────┐   ┌───────────────────────────────────┐   │
//! │  │   Write     │   │  Levels (L0 newest)               │   │
//! │  │   Buffer    │   │  L0: [run run run]  ┐ merge ─► L1 │   │
//! │  │ (resolved   │   │  L1: [run run]      ┘ (stepped)   │   │
//! │  │  on insert) │   │  L2: [run]                        │   │
//! │  └──────┬──────┘   └───────────────▲───────────────────┘   │
//! │         │  flush                   │ credit per update     │
//! │         └──────────────────────────┘                       │
//! │                                                            │
//! │  lookup: bloom probe → compact index → batched page fetch  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`session`] | Root directory ownership, run ids, snapshot registry |
//! | [`table`] | Level manager, credit scheduler, duplicate/union |
//! | [`write_buffer`] | In-memory sorted buffer with resolve-on-insert |
//! | [`run`] | Immutable on-disk runs: pages, bloom filter, compact index |
//! | [`merge`] | Stepped k-way merge of runs |
//! | [`lookup`] | Batched bloom → index → page-fetch lookup pipeline |
//! | [`encoding`] | Deterministic little-endian wire format for sidecars |
//!
//! ## Key properties
//!
//! - **Monoidal upserts** — an update can combine with the stored value
//!   via a host-supplied associative `⊕` instead of replacing it.
//! - **Incremental merges** — compaction advances a bounded number of
//!   entries per user update, so no operation pays for a whole merge.
//! - **Reference-counted runs** — duplicates, snapshots, and in-progress
//!   merges share runs; the last reference unlinks a run's four files.
//! - **Blob separation** — large payloads live out-of-line in a per-run
//!   blob file, addressed by `(offset, length)` spans.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stratumdb::{Session, StoreConfig};
//!
//! let session = Session::open("/tmp/my_store", StoreConfig::default()).unwrap();
//!
//! // `⊕` for mupserts: byte concatenation, newer value appended.
//! let resolve = Arc::new(|new: &[u8], old: &[u8]| {
//!     let mut v = old.to_vec();
//!     v.extend_from_slice(new);
//!     v
//! });
//! let table = session.new_table(resolve).unwrap();
//!
//! table.insert(b"k1".to_vec(), b"v1".to_vec()).unwrap();
//! assert_eq!(table.lookup(b"k1").unwrap(), Some(b"v1".to_vec()));
//!
//! table.delete(b"k1".to_vec()).unwrap();
//! assert_eq!(table.lookup(b"k1").unwrap(), None);
//!
//! // Cheap copy-on-write duplicate.
//! let copy = table.duplicate().unwrap();
//! copy.insert(b"k2".to_vec(), b"v2".to_vec()).unwrap();
//! assert_eq!(table.lookup(b"k2").unwrap(), None);
//!
//! // Named snapshot, reopened later.
//! table.snapshot("before-import", "bytes").unwrap();
//! let frozen = session.open_snapshot("before-import", "bytes").unwrap();
//! # let _ = frozen;
//! ```

pub mod config;
pub mod encoding;
pub mod entry;
pub mod error;
pub mod lookup;
pub mod merge;
pub mod run;
pub mod session;
pub mod table;
pub mod write_buffer;

pub use config::{BloomFilterAlloc, CachePolicy, StoreConfig};
pub use entry::{BlobSpan, Entry, Key, Resolve, Value};
pub use error::StoreError;
pub use lookup::LookupResult;
pub use session::{Session, SnapshotName};
pub use table::Table;
pub use write_buffer::WriteBuffer;

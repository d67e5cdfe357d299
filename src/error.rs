//! Crate-wide error type.
//!
//! Every public operation either completes or fails with one of the kinds
//! below. `Io` failures are potentially transient and may be retried by
//! the caller; every other kind is fatal for the operation that raised it.
//! Partial on-disk effects are rolled back by closing the affected run or
//! merge, so no error leaves stray files behind.

use std::io;

use thiserror::Error;

use crate::encoding::EncodingError;

/// Errors returned by sessions, tables, runs, merges, and lookups.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Operation invoked on a closed table or session.
    #[error("handle is closed")]
    HandleClosed,

    /// No snapshot is registered under the given name.
    #[error("no such snapshot: {0}")]
    NoSuchSnapshot(String),

    /// The stored snapshot's key/value types differ from the caller's.
    #[error("snapshot {name:?} holds {stored}, caller expected {requested}")]
    SnapshotTypeMismatch {
        /// Name of the snapshot being opened.
        name: String,
        /// Type tag recorded when the snapshot was taken.
        stored: String,
        /// Type tag supplied by the caller.
        requested: String,
    },

    /// The string is not a well-formed snapshot name.
    #[error("invalid snapshot name: {0:?}")]
    InvalidSnapshotName(String),

    /// The two tables belong to different sessions.
    #[error("tables belong to different sessions")]
    DifferentSessions,

    /// The key exceeds the maximum encodable length.
    #[error("key of {len} bytes exceeds the {max} byte limit")]
    KeyTooLarge {
        /// Length of the offending key.
        len: usize,
        /// Maximum supported key length.
        max: usize,
    },

    /// Underlying filesystem or block-I/O error. Recoverable: the caller
    /// may retry the operation.
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    /// An on-disk structure failed a checksum or internal invariant check.
    #[error("corruption: {0}")]
    Corruption(String),
}

impl From<EncodingError> for StoreError {
    fn from(e: EncodingError) -> Self {
        StoreError::Corruption(e.to_string())
    }
}

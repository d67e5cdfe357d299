//! Session — root-directory ownership, run identifiers, snapshots.
//!
//! A session owns a filesystem root directory and is the factory for
//! tables. It allocates the monotonically increasing run identifiers,
//! and it holds the process-wide snapshot registry: a serialized mapping
//! from snapshot name to a frozen table descriptor (the per-level run
//! references, kept alive by the registry until the snapshot is deleted
//! or the session closes).
//!
//! The session assumes exclusive control of its root directory; nothing
//! else may create or remove files under it.


use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::config::StoreConfig;
use crate::entry::Resolve;
use crate::error::StoreError;
use crate::run::{Run, RunPaths};
use crate::table::Table;

const RUNS_DIR: &str = "runs";

// ------------------------------------------------------------------------------------------------
// Snapshot names
// ------------------------------------------------------------------------------------------------

/// A validated snapshot name: 1–64 characters of `[a-z0-9_-]`, valid as
/// both a POSIX and a Windows filename, and not a reserved device name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotName(String);

/// Windows device names that are unusable as filenames. The grammar is
/// lowercase-only, so lowercase forms suffice.
const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

impl SnapshotName {
    /// Validates a snapshot name, rejecting anything outside the
    /// grammar.
    pub fn new(name: &str) -> Result<Self, StoreError> {
        let valid_chars = name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
        if name.is_empty() || name.len() > 64 || !valid_chars || RESERVED_NAMES.contains(&name) {
            return Err(StoreError::InvalidSnapshotName(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    /// The validated name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

struct SnapshotDescriptor {
    levels: Vec<Vec<Arc<Run>>>,
    resolve: Resolve,
    type_tag: String,
}

// ------------------------------------------------------------------------------------------------
// SessionShared — state behind every handle created by this session
// ------------------------------------------------------------------------------------------------

pub(crate) struct SessionShared {
    root: PathBuf,
    config: StoreConfig,
    next_run_id: AtomicU64,
    snapshots: Mutex<HashMap<SnapshotName, SnapshotDescriptor>>,
    closed: AtomicBool,
}

impl SessionShared {
    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Allocates a fresh run identifier and the paths that go with it.
    pub(crate) fn new_run_paths(&self) -> RunPaths {
        let id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        RunPaths::new(self.root.join(RUNS_DIR), id)
    }

    pub(crate) fn register_snapshot(
        &self,
        name: SnapshotName,
        levels: Vec<Vec<Arc<Run>>>,
        resolve: Resolve,
        type_tag: &str,
    ) -> Result<(), StoreError> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|_| StoreError::Corruption("snapshot registry poisoned".into()))?;
        // A previous snapshot of the same name is replaced; its runs are
        // released with it.
        snapshots.insert(
            name,
            SnapshotDescriptor {
                levels,
                resolve,
                type_tag: type_tag.to_string(),
            },
        );
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Session
// ------------------------------------------------------------------------------------------------

/// A handle to an open session. Cloning shares the session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Opens a session rooted at `path`, creating the directory layout
    /// if needed.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Session, StoreError> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(root.join(RUNS_DIR))?;
        info!(root = %root.display(), "session opened");
        Ok(Session {
            shared: Arc::new(SessionShared {
                root,
                config: config.sanitized(),
                next_run_id: AtomicU64::new(0),
                snapshots: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The configuration this session was opened with.
    pub fn config(&self) -> &StoreConfig {
        self.shared.config()
    }

    /// Creates a new, empty table.
    ///
    /// `resolve` is the associative `⊕` used to resolve monoidal
    /// upserts for this table.
    pub fn new_table(&self, resolve: Resolve) -> Result<Table, StoreError> {
        if self.shared.is_closed() {
            return Err(StoreError::HandleClosed);
        }
        Ok(Table::create(Arc::clone(&self.shared), resolve))
    }

    /// Materializes a registered snapshot as a new independent table.
    ///
    /// `type_tag` must equal the tag recorded when the snapshot was
    /// taken; a mismatch fails with [`StoreError::SnapshotTypeMismatch`].
    pub fn open_snapshot(&self, name: &str, type_tag: &str) -> Result<Table, StoreError> {
        if self.shared.is_closed() {
            return Err(StoreError::HandleClosed);
        }
        let name = SnapshotName::new(name)?;
        let snapshots = self
            .shared
            .snapshots
            .lock()
            .map_err(|_| StoreError::Corruption("snapshot registry poisoned".into()))?;
        let Some(desc) = snapshots.get(&name) else {
            return Err(StoreError::NoSuchSnapshot(name.as_str().to_string()));
        };
        if desc.type_tag != type_tag {
            return Err(StoreError::SnapshotTypeMismatch {
                name: name.as_str().to_string(),
                stored: desc.type_tag.clone(),
                requested: type_tag.to_string(),
            });
        }
        info!(name = name.as_str(), "snapshot opened");
        Ok(Table::from_levels(
            Arc::clone(&self.shared),
            desc.resolve.clone(),
            desc.levels.clone(),
        ))
    }

    /// Removes a snapshot from the registry, releasing its run
    /// references.
    pub fn delete_snapshot(&self, name: &str) -> Result<(), StoreError> {
        if self.shared.is_closed() {
            return Err(StoreError::HandleClosed);
        }
        let name = SnapshotName::new(name)?;
        let mut snapshots = self
            .shared
            .snapshots
            .lock()
            .map_err(|_| StoreError::Corruption("snapshot registry poisoned".into()))?;
        if snapshots.remove(&name).is_none() {
            return Err(StoreError::NoSuchSnapshot(name.as_str().to_string()));
        }
        info!(name = name.as_str(), "snapshot deleted");
        Ok(())
    }

    /// Names of all registered snapshots, unordered.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotName>, StoreError> {
        if self.shared.is_closed() {
            return Err(StoreError::HandleClosed);
        }
        let snapshots = self
            .shared
            .snapshots
            .lock()
            .map_err(|_| StoreError::Corruption("snapshot registry poisoned".into()))?;
        Ok(snapshots.keys().cloned().collect())
    }

    /// Closes the session. The snapshot registry is cleared (releasing
    /// its run references) and subsequent operations on the session or
    /// its tables fail with [`StoreError::HandleClosed`].
    pub fn close(&self) -> Result<(), StoreError> {
        self.shared.closed.store(true, Ordering::Release);
        let mut snapshots = self
            .shared
            .snapshots
            .lock()
            .map_err(|_| StoreError::Corruption("snapshot registry poisoned".into()))?;
        snapshots.clear();
        info!("session closed");
        Ok(())
    }
}

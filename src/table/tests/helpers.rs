//! Shared helpers for table tests.

use std::sync::Arc;

use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::config::StoreConfig;
use crate::entry::Resolve;
use crate::session::Session;
use crate::table::Table;

pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .try_init();
}

/// `⊕` = byte concatenation appending the newer value after the older
/// one, so a chain of mupserts reads in application order.
pub fn concat_resolve() -> Resolve {
    Arc::new(|new: &[u8], old: &[u8]| {
        let mut v = old.to_vec();
        v.extend_from_slice(new);
        v
    })
}

/// Tiny capacities so a handful of updates exercises flushes, merges,
/// and level cascades.
pub fn small_config() -> StoreConfig {
    StoreConfig {
        write_buffer_entries: 4,
        level_run_bound: 2,
        range_finder_precision: 8,
        chunk_size: 4,
        ..StoreConfig::default()
    }
}

/// Fresh session + table over a temp dir. The temp dir handle must stay
/// alive as long as the session.
pub fn fresh_table(config: StoreConfig) -> (TempDir, Session, Table) {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let session = Session::open(tmp.path(), config).unwrap();
    let table = session.new_table(concat_resolve()).unwrap();
    (tmp, session, table)
}

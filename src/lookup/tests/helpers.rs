//! Shared helpers for lookup tests.

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::config::StoreConfig;
use crate::entry::Resolve;

pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .try_init();
}

/// Config with small knobs so lookups span several pages per run.
pub fn test_config() -> StoreConfig {
    StoreConfig {
        range_finder_precision: 8,
        chunk_size: 4,
        write_buffer_entries: 16,
        ..StoreConfig::default()
    }
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

//! Pull-based entry stream over a run.
//!
//! A [`RunCursor`] walks a run's k/ops file page by page, decoding
//! entries on demand. It is the finite, non-restartable `(key, entry)`
//! sequence consumed by merges and range lookups: `peek` inspects the
//! next pair without consuming it, `advance` consumes and returns it.

use std::sync::Arc;

use crate::entry::{Entry, Key};
use crate::error::StoreError;
use crate::run::Run;
use crate::run::page::{PAGE_SIZE, RawPage};

/// Cursor over one run's entries in key order.
pub struct RunCursor {
    run: Arc<Run>,
    /// Next slot to decode a page from.
    slot: usize,
    /// Entry index within the current page.
    entry_ix: usize,
    /// Entries in the current page; zero when no page is loaded.
    page_elems: usize,
    /// Slots occupied by the current page.
    page_slots: usize,
    /// The next undelivered pair.
    current: Option<(Key, Entry)>,
}

impl RunCursor {
    /// Positions a cursor at the run's first entry.
    pub fn new(run: Arc<Run>) -> Result<Self, StoreError> {
        let mut cursor = Self {
            run,
            slot: 0,
            entry_ix: 0,
            page_elems: 0,
            page_slots: 0,
            current: None,
        };
        cursor.load_next()?;
        Ok(cursor)
    }

    /// Positions a cursor at the first entry whose key is `>= key`.
    pub fn seek(run: Arc<Run>, key: &[u8]) -> Result<Self, StoreError> {
        let start_page = run.index().seek_page(key);
        let mut cursor = Self {
            slot: start_page.map(|p| run.index().page_slot(p) as usize).unwrap_or(0),
            run,
            entry_ix: 0,
            page_elems: 0,
            page_slots: 0,
            current: None,
        };
        cursor.load_next()?;
        while let Some((k, _)) = &cursor.current {
            if k.as_slice() >= key {
                break;
            }
            cursor.advance()?;
        }
        Ok(cursor)
    }

    /// The next pair, without consuming it.
    pub fn peek(&self) -> Option<&(Key, Entry)> {
        self.current.as_ref()
    }

    /// Consumes and returns the next pair; `None` once exhausted.
    pub fn advance(&mut self) -> Result<Option<(Key, Entry)>, StoreError> {
        let delivered = self.current.take();
        if delivered.is_some() {
            self.load_next()?;
        }
        Ok(delivered)
    }

    /// Decodes the next pair into `current`.
    fn load_next(&mut self) -> Result<(), StoreError> {
        debug_assert!(self.current.is_none());
        let bytes = self.run.keyops_bytes();
        loop {
            if self.page_elems == 0 {
                // Load the page starting at `slot`, if any remains.
                if self.slot * PAGE_SIZE >= bytes.len() {
                    return Ok(());
                }
                let page = RawPage::new(&bytes[self.slot * PAGE_SIZE..])?;
                self.page_elems = page.num_elems();
                self.page_slots = page.slots();
                self.entry_ix = 0;
            }
            let page = RawPage::new(&bytes[self.slot * PAGE_SIZE..])?;
            if self.entry_ix < self.page_elems {
                let key = page.key(self.entry_ix).to_vec();
                let entry = page.entry(self.entry_ix)?;
                self.entry_ix += 1;
                self.current = Some((key, entry));
                return Ok(());
            }
            // Page exhausted; skip its slots (several for an oversized
            // entry) and loop to load the next one.
            self.slot += self.page_slots;
            self.page_elems = 0;
            self.page_slots = 0;
        }
    }
}

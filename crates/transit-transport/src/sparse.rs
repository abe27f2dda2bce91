//! Sparse, lazily-committed transmission record table.
//!
//! Backs both the Sender Transmission Record store and the Receiver
//! Transmission Record store. Transmission ids are 31 bits; a flat
//! `Vec`/`HashMap` either wastes memory up front or pays hashing overhead on
//! every lookup. Instead this is a two-level page table: a top-level array
//! covering every possible page, each entry an [`ArcSwapOption`] that starts
//! `None` and is installed exactly once, on first touch, behind a
//! page-local install lock that's never taken again afterward. Reads of an
//! already-committed page are lock-free (`ArcSwapOption::load_full`).

use arc_swap::ArcSwapOption;
use std::sync::{Arc, Mutex};

/// Bits of the id used to select a slot within a page. 2^14 = 16384
/// records per page.
const PAGE_BITS: u32 = 14;
const PAGE_SIZE: usize = 1 << PAGE_BITS;
const PAGE_MASK: u32 = (PAGE_SIZE as u32) - 1;

/// 2^31 ids / 2^14 per page = 2^17 pages.
const NUM_PAGES: usize = 1 << (31 - PAGE_BITS);

struct Page<T> {
    entries: Box<[Mutex<Option<Arc<T>>>]>,
}

impl<T> Page<T> {
    fn new() -> Self {
        Page {
            entries: (0..PAGE_SIZE).map(|_| Mutex::new(None)).collect(),
        }
    }
}

/// The sparse record table itself.
pub struct SparseTable<T> {
    pages: Box<[ArcSwapOption<Page<T>>]>,
    install_locks: Box<[Mutex<()>]>,
}

impl<T> SparseTable<T> {
    pub fn new() -> Self {
        SparseTable {
            pages: (0..NUM_PAGES).map(|_| ArcSwapOption::from(None)).collect(),
            install_locks: (0..NUM_PAGES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn split(id: u32) -> (usize, usize) {
        let page_idx = (id >> PAGE_BITS) as usize;
        let slot_idx = (id & PAGE_MASK) as usize;
        (page_idx, slot_idx)
    }

    fn page(&self, page_idx: usize) -> Arc<Page<T>> {
        if let Some(existing) = self.pages[page_idx].load_full() {
            return existing;
        }
        let _guard = self.install_locks[page_idx].lock().expect("sparse table install lock poisoned");
        if let Some(existing) = self.pages[page_idx].load_full() {
            return existing;
        }
        let fresh = Arc::new(Page::new());
        self.pages[page_idx].store(Some(Arc::clone(&fresh)));
        fresh
    }

    pub fn get(&self, id: u32) -> Option<Arc<T>> {
        let (page_idx, slot_idx) = Self::split(id);
        if self.pages[page_idx].load_full().is_none() {
            return None;
        }
        let page = self.page(page_idx);
        let slot = page.entries[slot_idx].lock().expect("sparse table slot lock poisoned");
        slot.clone()
    }

    /// Install `value` for `id` only if no record is currently present.
    /// Returns the live record either way, plus whether this call installed
    /// it (first-writer-wins: `send_transmission` on an id already in
    /// flight must be rejected, not silently overwritten).
    pub fn insert_if_absent(&self, id: u32, value: T) -> (Arc<T>, bool) {
        let (page_idx, slot_idx) = Self::split(id);
        let page = self.page(page_idx);
        let mut slot = page.entries[slot_idx].lock().expect("sparse table slot lock poisoned");
        if let Some(existing) = slot.as_ref() {
            return (Arc::clone(existing), false);
        }
        let arc = Arc::new(value);
        *slot = Some(Arc::clone(&arc));
        (arc, true)
    }

    /// Remove and return the record for `id`, if present.
    pub fn remove(&self, id: u32) -> Option<Arc<T>> {
        let (page_idx, slot_idx) = Self::split(id);
        if self.pages[page_idx].load_full().is_none() {
            return None;
        }
        let page = self.page(page_idx);
        let mut slot = page.entries[slot_idx].lock().expect("sparse table slot lock poisoned");
        slot.take()
    }
}

impl<T> Default for SparseTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

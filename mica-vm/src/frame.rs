//! The frame table.
//!
//! Tracks which user-pool frames currently back a live page, and evicts
//! one when the pool runs dry. Each record pairs the frame with a
//! back-pointer to the owning supplemental page-table entry; eviction
//! follows the back-pointer to rewrite the victim's provenance.
//!
//! Replacement is the clock algorithm over the hardware accessed bit of
//! each owner's user page: a swept frame whose bit is set gets the bit
//! cleared and survives the round; a frame whose bit is clear is the
//! victim. A frame whose owner is mid-fault on another thread (its entry
//! mutex is held) is skipped by the sweep.
use crate::page::{PageSource, Spte};
use crate::swap::SwapTable;
use mica::mm::{Kva, PAGE_SIZE, PageRef, UserPool};
use mica::sync::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

struct FrameEntry {
    kpage: Kva,
    owner: Arc<Spte>,
}

struct FrameInner {
    frames: Vec<FrameEntry>,
    cursor: usize,
}

/// The table of user frames backing live pages.
pub struct FrameTable {
    pool: Arc<UserPool>,
    swap: Arc<SwapTable>,
    inner: Mutex<FrameInner>,
    evictions: AtomicUsize,
}

impl FrameTable {
    /// Creates a frame table over `pool`, evicting to `swap`.
    pub fn new(pool: Arc<UserPool>, swap: Arc<SwapTable>) -> Self {
        Self {
            pool,
            swap,
            inner: Mutex::new(FrameInner {
                frames: Vec::new(),
                cursor: 0,
            }),
            evictions: AtomicUsize::new(0),
        }
    }

    /// Number of evictions performed since boot.
    pub fn evictions(&self) -> usize {
        self.evictions.load(Ordering::SeqCst)
    }

    /// Obtains a frame for `owner`, evicting another page if the pool is
    /// exhausted.
    ///
    /// Returns `None` only when eviction cannot help either: the table is
    /// empty, the swap device is full, or every frame's owner is busy.
    pub fn alloc(&self, owner: &Arc<Spte>) -> Option<Kva> {
        let mut inner = self.inner.lock();

        if let Some(kpage) = self.pool.get_page() {
            inner.frames.push(FrameEntry {
                kpage,
                owner: owner.clone(),
            });
            return Some(kpage);
        }

        // The pool is dry; run the clock over the table.
        let mut contended = 0;
        loop {
            if inner.frames.is_empty() || contended >= inner.frames.len() {
                return None;
            }
            let idx = inner.cursor % inner.frames.len();
            inner.cursor = idx + 1;

            let victim = inner.frames[idx].owner.clone();
            let kpage = inner.frames[idx].kpage;

            // An owner whose entry is locked is mid-fault; skip it.
            let Some(mut state) = victim.state.try_lock() else {
                contended += 1;
                continue;
            };
            contended = 0;

            if victim.pagedir.is_accessed(victim.upage) {
                victim.pagedir.set_accessed(victim.upage, false);
                continue;
            }

            // Victim found. Decide where its content goes: read-only file
            // pages and clean pages can be re-produced and are dropped;
            // anything dirty, and anything already of swap provenance,
            // goes to the swap device.
            let must_swap = match &state.source {
                PageSource::File {
                    writable: false, ..
                } => false,
                PageSource::File { .. } | PageSource::Zero => {
                    victim.update_dirty_locked(&mut state)
                }
                PageSource::Swap { .. } => true,
            };
            if must_swap {
                let page = unsafe { PageRef::from_kva(kpage) };
                let image: &[u8; PAGE_SIZE] = page.inner().try_into().unwrap();
                let Some(slot) = self.swap.swap_out(image) else {
                    // Out of swap: the eviction, and the allocation, fail.
                    log::warn!("eviction of {:#x} failed: swap full", victim.upage.0);
                    return None;
                };
                state.source = PageSource::Swap { slot };
            }

            victim.update_dirty_locked(&mut state);
            state.kpage = None;
            victim.pagedir.clear_page(victim.upage);
            drop(state);

            self.evictions.fetch_add(1, Ordering::SeqCst);
            log::debug!("evicted upage {:#x} (to_swap: {must_swap})", victim.upage.0);

            inner.frames[idx].owner = owner.clone();
            return Some(kpage);
        }
    }

    /// Removes the record for `kpage` and returns the frame to the pool.
    pub fn free(&self, kpage: Kva) {
        self.withdraw(kpage);
        self.pool.free_page(kpage);
    }

    /// Removes the record for `kpage` without freeing the physical page.
    ///
    /// Used when control of the page transfers to another path, such as
    /// the mmap write-back.
    pub fn remove(&self, kpage: Kva) {
        self.withdraw(kpage);
    }

    fn withdraw(&self, kpage: Kva) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.frames.iter().position(|entry| entry.kpage == kpage) {
            inner.frames.remove(pos);
            if inner.cursor > pos {
                inner.cursor -= 1;
            }
        }
    }
}

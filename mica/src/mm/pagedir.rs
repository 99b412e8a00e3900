//! The hardware page directory.
//!
//! A per-process translation from user virtual page to physical frame, with
//! the bookkeeping bits real paging hardware maintains: present, writable,
//! user, accessed and dirty. The VM layer treats this exactly like an MMU:
//! it installs and clears translations, and it reads and resets the
//! accessed/dirty bits to drive clock eviction and write-back decisions.
//!
//! Because there is no MMU underneath, the bits are latched by the access
//! paths instead of by hardware: every probed user-memory access calls
//! [`PageDirectory::mark_access`] on its way through.
use crate::mm::{Kva, PAGE_MASK, Va};
use crate::sync::Mutex;
use std::collections::BTreeMap;

bitflags::bitflags! {
    /// Flags of a page-table entry.
    pub struct PteFlags: usize {
        /// Present; the entry holds a valid translation.
        const P = 1 << 0;
        /// Read/write; if 0, user writes to the page fault.
        const RW = 1 << 1;
        /// User; the page is reachable from user mode.
        const US = 1 << 2;
        /// Accessed; set on every load or store through the entry.
        const A = 1 << 5;
        /// Dirty; set on every store through the entry.
        const D = 1 << 6;
    }
}

/// A page-table entry: a frame address with [`PteFlags`] in the low bits.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Pte(usize);

impl Pte {
    fn new(kva: Kva, flags: PteFlags) -> Self {
        debug_assert_eq!(kva.into_usize() & PAGE_MASK, 0);
        Pte(kva.into_usize() | flags.bits())
    }

    /// Get the frame address held by this entry, if present.
    #[inline]
    pub fn kva(&self) -> Option<Kva> {
        if self.flags().contains(PteFlags::P) {
            Some(Kva(self.0 & !PAGE_MASK))
        } else {
            None
        }
    }

    /// Get the flags of this entry.
    #[inline]
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    fn set_flags(&mut self, flags: PteFlags) {
        self.0 = (self.0 & !PAGE_MASK) | flags.bits();
    }
}

/// A per-process page directory.
///
/// Mappings are keyed by page-aligned user virtual address.
pub struct PageDirectory {
    user: Mutex<BTreeMap<usize, Pte>>,
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory {
    /// Creates an empty page directory.
    pub fn new() -> Self {
        Self {
            user: Mutex::new(BTreeMap::new()),
        }
    }

    /// Installs the translation `upage` → `kpage`.
    ///
    /// Returns `false` if `upage` is already mapped.
    pub fn set_page(&self, upage: Va, kpage: Kva, writable: bool) -> bool {
        debug_assert!(upage.is_page_aligned());
        let mut user = self.user.lock();
        if user.contains_key(&upage.into_usize()) {
            return false;
        }
        let mut flags = PteFlags::P | PteFlags::US;
        if writable {
            flags |= PteFlags::RW;
        }
        user.insert(upage.into_usize(), Pte::new(kpage, flags));
        true
    }

    /// Removes the translation for `upage`, returning the frame it mapped.
    pub fn clear_page(&self, upage: Va) -> Option<Kva> {
        let pte = self.user.lock().remove(&upage.into_usize())?;
        pte.kva()
    }

    /// Looks up the frame mapped at `upage`.
    pub fn get_page(&self, upage: Va) -> Option<Kva> {
        self.user.lock().get(&upage.into_usize())?.kva()
    }

    /// Whether the mapping at `upage` permits user writes.
    pub fn is_writable(&self, upage: Va) -> bool {
        self.user
            .lock()
            .get(&upage.into_usize())
            .map(|pte| pte.flags().contains(PteFlags::RW))
            .unwrap_or(false)
    }

    /// Latches an access through the mapping at `upage`, as the MMU would.
    ///
    /// Sets the accessed bit, and the dirty bit too when `write` holds.
    pub fn mark_access(&self, upage: Va, write: bool) {
        if let Some(pte) = self.user.lock().get_mut(&upage.into_usize()) {
            let mut flags = pte.flags() | PteFlags::A;
            if write {
                flags |= PteFlags::D;
            }
            pte.set_flags(flags);
        }
    }

    /// Whether the mapping at `upage` has its dirty bit set.
    pub fn is_dirty(&self, upage: Va) -> bool {
        self.user
            .lock()
            .get(&upage.into_usize())
            .map(|pte| pte.flags().contains(PteFlags::D))
            .unwrap_or(false)
    }

    /// Sets or clears the dirty bit of the mapping at `upage`.
    pub fn set_dirty(&self, upage: Va, dirty: bool) {
        if let Some(pte) = self.user.lock().get_mut(&upage.into_usize()) {
            let mut flags = pte.flags();
            flags.set(PteFlags::D, dirty);
            pte.set_flags(flags);
        }
    }

    /// Whether the mapping at `upage` has its accessed bit set.
    pub fn is_accessed(&self, upage: Va) -> bool {
        self.user
            .lock()
            .get(&upage.into_usize())
            .map(|pte| pte.flags().contains(PteFlags::A))
            .unwrap_or(false)
    }

    /// Sets or clears the accessed bit of the mapping at `upage`.
    pub fn set_accessed(&self, upage: Va, accessed: bool) {
        if let Some(pte) = self.user.lock().get_mut(&upage.into_usize()) {
            let mut flags = pte.flags();
            flags.set(PteFlags::A, accessed);
            pte.set_flags(flags);
        }
    }

    /// Tears the directory down, returning every frame that was mapped.
    ///
    /// The caller owns returning those frames to the physical allocator.
    pub fn clear_all(&self) -> Vec<Kva> {
        let mut user = self.user.lock();
        let frames = user.values().filter_map(|pte| pte.kva()).collect();
        user.clear();
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_query_unmap() {
        let pd = PageDirectory::new();
        let (upage, kpage) = (Va(0x8000_0000), Kva(0x1000));
        assert!(pd.set_page(upage, kpage, true));
        assert!(!pd.set_page(upage, kpage, true));
        assert_eq!(pd.get_page(upage), Some(kpage));
        assert!(pd.is_writable(upage));

        assert_eq!(pd.clear_page(upage), Some(kpage));
        assert_eq!(pd.get_page(upage), None);
    }

    #[test]
    fn access_bits_latch_and_reset() {
        let pd = PageDirectory::new();
        let upage = Va(0x8000_0000);
        pd.set_page(upage, Kva(0x2000), true);
        assert!(!pd.is_accessed(upage) && !pd.is_dirty(upage));

        pd.mark_access(upage, false);
        assert!(pd.is_accessed(upage) && !pd.is_dirty(upage));

        pd.mark_access(upage, true);
        assert!(pd.is_dirty(upage));

        pd.set_accessed(upage, false);
        pd.set_dirty(upage, false);
        assert!(!pd.is_accessed(upage) && !pd.is_dirty(upage));
    }

    #[test]
    fn read_only_mapping() {
        let pd = PageDirectory::new();
        let upage = Va(0x8000_0000);
        pd.set_page(upage, Kva(0x3000), false);
        assert!(!pd.is_writable(upage));
    }
}

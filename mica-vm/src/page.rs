//! The supplemental page table.
//!
//! The hardware page directory only knows which pages are resident. The
//! supplemental page table is the per-process record of how every mapped
//! page is *backed*, its provenance, so that a fault can materialize it:
//!
//! - [`PageSource::Zero`]: fresh anonymous memory, zero-filled on first
//!   touch (the stack page).
//! - [`PageSource::File`]: a window of a file, with a tail of zero bytes
//!   (executable segments and mmap regions).
//! - [`PageSource::Swap`]: a page previously evicted to a swap slot.
//!
//! Each entry is shared between this table and the frame table: the frame
//! backing a resident page points back at its owning [`Spte`] so the
//! eviction sweep can rewrite the page's provenance. Neither side owns the
//! physical page; that is the user pool's job.
use crate::frame::FrameTable;
use crate::swap::SwapTable;
use mica::KernelError;
use mica::mm::{Kva, PAGE_SIZE, PageDirectory, PageRef, Va};
use mica::sync::Mutex;
use mica_fs::{Fs, file::File};
use std::collections::BTreeMap;
use std::sync::Arc;

/// How a page is backed when it is not resident.
pub enum PageSource {
    /// Zero-filled anonymous memory.
    Zero,
    /// A page-sized window of a file.
    File {
        /// The backing file.
        file: Arc<File>,
        /// Byte offset of the window in the file.
        offset: usize,
        /// Bytes to read from the file; the rest of the page is zeroed.
        read_bytes: usize,
        /// Bytes to zero after `read_bytes`.
        zero_bytes: usize,
        /// Whether user stores to the page are allowed.
        writable: bool,
        /// Whether the page belongs to a memory-mapped region (and is
        /// written back to the file rather than discarded).
        mmap: bool,
    },
    /// A page held in a swap slot.
    Swap {
        /// Index of the slot.
        slot: usize,
    },
}

pub(crate) struct SpteState {
    pub(crate) source: PageSource,
    pub(crate) kpage: Option<Kva>,
    pub(crate) dirty: bool,
}

/// A supplemental page-table entry.
pub struct Spte {
    /// The user virtual page this entry describes.
    pub upage: Va,
    /// The page directory the page is (or will be) mapped in.
    pub pagedir: Arc<PageDirectory>,
    pub(crate) state: Mutex<SpteState>,
}

impl Spte {
    /// The frame currently backing the page, if resident.
    pub fn kpage(&self) -> Option<Kva> {
        self.state.lock().kpage
    }

    /// Whether the entry describes a memory-mapped file page.
    pub fn is_mmap(&self) -> bool {
        matches!(
            self.state.lock().source,
            PageSource::File { mmap: true, .. }
        )
    }

    /// Whether the entry currently lives in a swap slot.
    pub fn in_swap(&self) -> bool {
        let state = self.state.lock();
        state.kpage.is_none() && matches!(state.source, PageSource::Swap { .. })
    }

    /// Takes ownership of the entry's swap slot, if it holds one.
    ///
    /// The entry is left as plain anonymous memory, so a later
    /// [`SupplPageTable::clear_page`] will not release the slot a second
    /// time. Used by the mmap write-back, which pages the slot in itself.
    pub fn take_swap_slot(&self) -> Option<usize> {
        let mut state = self.state.lock();
        if state.kpage.is_none() {
            if let PageSource::Swap { slot } = state.source {
                state.source = PageSource::Zero;
                return Some(slot);
            }
        }
        None
    }

    /// Folds the hardware dirty bit of the user page into the latched
    /// dirty flag and returns it. Once latched, the flag stays set until
    /// the entry is destroyed or the page is written back.
    pub fn update_dirty(&self) -> bool {
        let mut state = self.state.lock();
        self.update_dirty_locked(&mut state)
    }

    pub(crate) fn update_dirty_locked(&self, state: &mut SpteState) -> bool {
        if state.kpage.is_some() {
            state.dirty = state.dirty || self.pagedir.is_dirty(self.upage);
        }
        state.dirty
    }
}

/// The per-process map from user virtual page to [`Spte`].
pub struct SupplPageTable {
    pagedir: Arc<PageDirectory>,
    entries: Mutex<BTreeMap<usize, Arc<Spte>>>,
}

impl SupplPageTable {
    /// Creates an empty table over `pagedir`.
    pub fn new(pagedir: Arc<PageDirectory>) -> Self {
        Self {
            pagedir,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// The page directory this table shadows.
    pub fn pagedir(&self) -> &Arc<PageDirectory> {
        &self.pagedir
    }

    fn install(&self, upage: Va, source: PageSource) -> Result<(), KernelError> {
        debug_assert!(upage.is_page_aligned() && upage.is_user());
        let mut entries = self.entries.lock();
        if entries.contains_key(&upage.into_usize()) {
            return Err(KernelError::InvalidArgument);
        }
        entries.insert(
            upage.into_usize(),
            Arc::new(Spte {
                upage,
                pagedir: self.pagedir.clone(),
                state: Mutex::new(SpteState {
                    source,
                    kpage: None,
                    dirty: false,
                }),
            }),
        );
        Ok(())
    }

    /// Registers `upage` as zero-filled anonymous memory.
    pub fn set_zero(&self, upage: Va) -> Result<(), KernelError> {
        self.install(upage, PageSource::Zero)
    }

    /// Registers `upage` as a window of `file`.
    ///
    /// `read_bytes + zero_bytes` must equal the page size.
    #[allow(clippy::too_many_arguments)]
    pub fn set_file(
        &self,
        upage: Va,
        file: Arc<File>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
        mmap: bool,
    ) -> Result<(), KernelError> {
        debug_assert_eq!(read_bytes + zero_bytes, PAGE_SIZE);
        self.install(
            upage,
            PageSource::File {
                file,
                offset,
                read_bytes,
                zero_bytes,
                writable,
                mmap,
            },
        )
    }

    /// Looks up the entry for `upage`.
    pub fn get(&self, upage: Va) -> Option<Arc<Spte>> {
        self.entries.lock().get(&upage.into_usize()).cloned()
    }

    /// Demand-fault materialization of `upage`.
    ///
    /// Obtains a frame (possibly evicting another page), populates it from
    /// the entry's provenance, installs the hardware mapping with the
    /// entry's writability, and records the residency. Fails if the page
    /// is unknown or already resident, or when neither a frame nor the
    /// backing content can be produced; a frame obtained along the way is
    /// returned to the pool on failure.
    pub fn load(
        &self,
        fs: &Fs,
        frames: &FrameTable,
        swap: &SwapTable,
        upage: Va,
    ) -> Result<(), KernelError> {
        let pte = self.get(upage).ok_or(KernelError::BadAddress)?;
        let mut state = pte.state.lock();
        if state.kpage.is_some() {
            return Err(KernelError::InvalidArgument);
        }

        let kpage = frames.alloc(&pte).ok_or(KernelError::NoMemory)?;
        let mut page = unsafe { PageRef::from_kva(kpage) };
        let buf: &mut [u8; PAGE_SIZE] = page.inner_mut().try_into().unwrap();

        let writable = match &state.source {
            PageSource::Zero => {
                buf.fill(0);
                true
            }
            PageSource::File {
                file,
                offset,
                read_bytes,
                writable,
                ..
            } => {
                if file.read_at(fs, &mut buf[..*read_bytes], *offset) != *read_bytes {
                    frames.free(kpage);
                    return Err(KernelError::IOError);
                }
                buf[*read_bytes..].fill(0);
                *writable
            }
            PageSource::Swap { slot } => {
                if let Err(e) = swap.swap_in(*slot, buf) {
                    frames.free(kpage);
                    return Err(e);
                }
                true
            }
        };

        if !pte.pagedir.set_page(upage, kpage, writable) {
            frames.free(kpage);
            return Err(KernelError::InvalidArgument);
        }
        pte.pagedir.set_dirty(upage, false);
        state.kpage = Some(kpage);
        Ok(())
    }

    /// Unmaps `upage` and removes its entry.
    ///
    /// A swapped-out entry releases its slot; a resident entry's frame is
    /// withdrawn from the frame table and returned to the caller, which
    /// decides whether the physical page is freed (the mmap write-back
    /// path hands it back itself).
    pub fn clear_page(&self, frames: &FrameTable, swap: &SwapTable, upage: Va) -> Option<Kva> {
        let pte = self.entries.lock().remove(&upage.into_usize())?;
        let state = pte.state.lock();
        pte.pagedir.clear_page(upage);
        match state.kpage {
            Some(kpage) => {
                frames.remove(kpage);
                Some(kpage)
            }
            None => {
                if let PageSource::Swap { slot } = state.source {
                    swap.release(slot);
                }
                None
            }
        }
    }

    /// Tears the table down, releasing swap slots and frame-table records.
    ///
    /// Physical pages are not freed here; the process teardown frees them
    /// when it destroys the hardware page directory.
    pub fn destroy(&self, frames: &FrameTable, swap: &SwapTable) {
        let mut entries = self.entries.lock();
        for (_, pte) in std::mem::take(&mut *entries) {
            let state = pte.state.lock();
            match state.kpage {
                Some(kpage) => frames.remove(kpage),
                None => {
                    if let PageSource::Swap { slot } = state.source {
                        swap.release(slot);
                    }
                }
            }
        }
    }

    /// Number of entries in the table.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

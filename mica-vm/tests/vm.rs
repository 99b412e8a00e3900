//! Demand-paging and eviction scenarios.
use mica::dev::{Disk, MemDisk};
use mica::mm::{PAGE_SIZE, PageDirectory, PageRef, UserPool, Va};
use mica_fs::Fs;
use mica_vm::{FrameTable, SupplPageTable, SwapTable};
use std::sync::Arc;

struct Rig {
    fs: Fs,
    pool: Arc<UserPool>,
    swap: Arc<SwapTable>,
    frames: FrameTable,
    pt: SupplPageTable,
    pagedir: Arc<PageDirectory>,
}

fn rig(frames: usize) -> Rig {
    let _ = env_logger::builder().is_test(true).try_init();
    let fs = Fs::format(Disk::new(MemDisk::new(1024))).unwrap();
    let pool = Arc::new(UserPool::new(frames));
    let swap = Arc::new(SwapTable::new(Disk::new(MemDisk::new(128))));
    let frames = FrameTable::new(pool.clone(), swap.clone());
    let pagedir = Arc::new(PageDirectory::new());
    let pt = SupplPageTable::new(pagedir.clone());
    Rig {
        fs,
        pool,
        swap,
        frames,
        pt,
        pagedir,
    }
}

fn upage(n: usize) -> Va {
    Va(0x1000_0000 + n * PAGE_SIZE)
}

/// Writes a byte into the resident frame of `page`, through the hardware
/// mapping, the way a user store would.
fn poke(rig: &Rig, page: Va, ofs: usize, value: u8) {
    let kpage = rig.pagedir.get_page(page).expect("page not resident");
    unsafe { PageRef::from_kva(kpage) }.inner_mut()[ofs] = value;
    rig.pagedir.mark_access(page, true);
}

fn peek(rig: &Rig, page: Va, ofs: usize) -> u8 {
    let kpage = rig.pagedir.get_page(page).expect("page not resident");
    rig.pagedir.mark_access(page, false);
    unsafe { PageRef::from_kva(kpage) }.inner()[ofs]
}

#[test]
fn zero_page_faults_in_zeroed_and_writable() {
    let r = rig(4);
    r.pt.set_zero(upage(0)).unwrap();

    // Not resident until loaded.
    assert!(r.pagedir.get_page(upage(0)).is_none());
    r.pt.load(&r.fs, &r.frames, &r.swap, upage(0)).unwrap();

    assert!(r.pagedir.is_writable(upage(0)));
    assert_eq!(peek(&r, upage(0), 123), 0);
    assert_eq!(r.pool.frames_in_use(), 1);

    // A second load of a resident page is refused.
    assert!(r.pt.load(&r.fs, &r.frames, &r.swap, upage(0)).is_err());
}

#[test]
fn file_page_faults_in_content_plus_zero_tail() {
    let r = rig(4);
    r.fs.create("blob", 0).unwrap();
    let f = r.fs.open("blob").unwrap();
    f.write_at(&r.fs, &[0x61u8; 100], 0);
    let file = Arc::new(f);

    r.pt
        .set_file(upage(1), file, 0, 100, PAGE_SIZE - 100, false, false)
        .unwrap();
    r.pt.load(&r.fs, &r.frames, &r.swap, upage(1)).unwrap();

    assert!(!r.pagedir.is_writable(upage(1)));
    assert_eq!(peek(&r, upage(1), 0), 0x61);
    assert_eq!(peek(&r, upage(1), 99), 0x61);
    assert_eq!(peek(&r, upage(1), 100), 0);
    assert_eq!(peek(&r, upage(1), PAGE_SIZE - 1), 0);
}

#[test]
fn clock_spares_the_accessed_and_swaps_the_dirty() {
    let r = rig(2);
    for n in 0..3 {
        r.pt.set_zero(upage(n)).unwrap();
    }
    r.pt.load(&r.fs, &r.frames, &r.swap, upage(0)).unwrap();
    r.pt.load(&r.fs, &r.frames, &r.swap, upage(1)).unwrap();

    // Page 0 is touched (accessed + dirty); page 1 is left cold.
    poke(&r, upage(0), 7, 0xd1);

    // Faulting page 2 must evict: the sweep clears page 0's accessed bit
    // and takes page 1, which is a clean zero page, so no swap I/O.
    r.pt.load(&r.fs, &r.frames, &r.swap, upage(2)).unwrap();
    assert_eq!(r.frames.evictions(), 1);
    assert_eq!(r.swap.used_slots(), 0);
    assert!(r.pagedir.get_page(upage(1)).is_none());

    // Faulting page 1 back in evicts page 0, which is dirty: it must be
    // preserved in a swap slot.
    r.pt.load(&r.fs, &r.frames, &r.swap, upage(1)).unwrap();
    assert_eq!(r.frames.evictions(), 2);
    assert_eq!(r.swap.used_slots(), 1);
    assert!(r.pt.get(upage(0)).unwrap().in_swap());

    // And faulting page 0 back restores the dirtied byte from swap.
    r.pt.load(&r.fs, &r.frames, &r.swap, upage(0)).unwrap();
    assert_eq!(peek(&r, upage(0), 7), 0xd1);
    assert_eq!(r.swap.used_slots(), 0, "swap-in frees the slot");
}

#[test]
fn read_only_file_pages_are_dropped_not_swapped() {
    let r = rig(1);
    r.fs.create("ro", 0).unwrap();
    let f = r.fs.open("ro").unwrap();
    f.write_at(&r.fs, b"constant", 0);
    let file = Arc::new(f);

    r.pt
        .set_file(upage(0), file.clone(), 0, 8, PAGE_SIZE - 8, false, false)
        .unwrap();
    r.pt.set_zero(upage(1)).unwrap();

    r.pt.load(&r.fs, &r.frames, &r.swap, upage(0)).unwrap();
    // The single frame is taken; faulting the zero page evicts the file
    // page, which is re-readable and must not cost a swap slot.
    r.pt.load(&r.fs, &r.frames, &r.swap, upage(1)).unwrap();
    assert_eq!(r.swap.used_slots(), 0);

    // Re-faulting the file page re-reads it from the file.
    r.pt.load(&r.fs, &r.frames, &r.swap, upage(0)).unwrap();
    assert_eq!(peek(&r, upage(0), 0), b'c');
}

#[test]
fn clean_writable_file_pages_are_dropped_not_swapped() {
    let r = rig(1);
    r.fs.create("lazy", 0).unwrap();
    let f = r.fs.open("lazy").unwrap();
    f.write_at(&r.fs, b"window", 0);
    let file = Arc::new(f);

    // A writable, mmap-style window that is faulted in but never stored
    // to stays clean.
    r.pt
        .set_file(upage(0), file, 0, 6, PAGE_SIZE - 6, true, true)
        .unwrap();
    r.pt.set_zero(upage(1)).unwrap();

    r.pt.load(&r.fs, &r.frames, &r.swap, upage(0)).unwrap();
    assert_eq!(peek(&r, upage(0), 0), b'w');
    r.pagedir.set_accessed(upage(0), false);

    // Its content can be re-read from the file, so evicting it must not
    // spend a swap slot even though the page is writable.
    r.pt.load(&r.fs, &r.frames, &r.swap, upage(1)).unwrap();
    assert_eq!(r.frames.evictions(), 1);
    assert_eq!(r.swap.used_slots(), 0);
    assert!(!r.pt.get(upage(0)).unwrap().in_swap());

    // Re-faulting it reads the file again.
    r.pt.load(&r.fs, &r.frames, &r.swap, upage(0)).unwrap();
    assert_eq!(peek(&r, upage(0), 0), b'w');
    assert_eq!(r.swap.used_slots(), 0);
}

#[test]
fn eviction_fails_when_swap_is_full() {
    let r = rig(1);
    // A swap device with a single slot.
    let swap = Arc::new(SwapTable::new(Disk::new(MemDisk::new(8))));
    let frames = FrameTable::new(r.pool.clone(), swap.clone());

    for n in 0..3 {
        r.pt.set_zero(upage(n)).unwrap();
    }
    r.pt.load(&r.fs, &frames, &swap, upage(0)).unwrap();
    poke(&r, upage(0), 0, 1);
    r.pagedir.set_accessed(upage(0), false);

    // Evicting dirty page 0 consumes the only slot.
    r.pt.load(&r.fs, &frames, &swap, upage(1)).unwrap();
    poke(&r, upage(1), 0, 2);
    r.pagedir.set_accessed(upage(1), false);
    assert_eq!(swap.used_slots(), 1);

    // No slot left for dirty page 1: the fault must fail cleanly and
    // page 1 must stay resident.
    assert!(r.pt.load(&r.fs, &frames, &swap, upage(2)).is_err());
    assert!(r.pagedir.get_page(upage(1)).is_some());
}

#[test]
fn clear_page_releases_what_the_entry_holds() {
    let r = rig(1);
    r.pt.set_zero(upage(0)).unwrap();
    r.pt.set_zero(upage(1)).unwrap();

    // Resident case: the frame record is withdrawn and the frame handed
    // back to the caller to free.
    r.pt.load(&r.fs, &r.frames, &r.swap, upage(0)).unwrap();
    poke(&r, upage(0), 0, 9);
    r.pagedir.set_accessed(upage(0), false);

    // Swapped case: evict page 0 first by faulting page 1.
    r.pt.load(&r.fs, &r.frames, &r.swap, upage(1)).unwrap();
    assert!(r.pt.get(upage(0)).unwrap().in_swap());
    assert_eq!(r.swap.used_slots(), 1);
    assert_eq!(r.pt.clear_page(&r.frames, &r.swap, upage(0)), None);
    assert_eq!(r.swap.used_slots(), 0, "slot released with the entry");

    let kpage = r.pt.clear_page(&r.frames, &r.swap, upage(1)).unwrap();
    r.pool.free_page(kpage);
    assert_eq!(r.pool.frames_in_use(), 0);
    assert!(r.pt.is_empty());
}

#[test]
fn destroy_reclaims_swap_slots_and_records() {
    let r = rig(1);
    r.pt.set_zero(upage(0)).unwrap();
    r.pt.set_zero(upage(1)).unwrap();

    r.pt.load(&r.fs, &r.frames, &r.swap, upage(0)).unwrap();
    poke(&r, upage(0), 0, 5);
    r.pagedir.set_accessed(upage(0), false);
    r.pt.load(&r.fs, &r.frames, &r.swap, upage(1)).unwrap();
    assert_eq!(r.swap.used_slots(), 1);

    r.pt.destroy(&r.frames, &r.swap);
    assert!(r.pt.is_empty());
    assert_eq!(r.swap.used_slots(), 0);

    // The hardware directory is torn down separately; its frames go back
    // to the pool then.
    for kpage in r.pagedir.clear_all() {
        r.pool.free_page(kpage);
    }
    assert_eq!(r.pool.frames_in_use(), 0);
}

//! The buffer cache.
//!
//! A fixed pool of 64 sector-sized entries between the inode layer and the
//! disk. The cache is write-back: writes dirty an entry and reach the disk
//! only on eviction, on [`BufferCache::invalidate`], on
//! [`BufferCache::flush_all`], or when the flush-back worker wakes up on
//! its 500 ms period. Replacement is the clock algorithm over per-entry
//! accessed bits.
//!
//! Two background threads belong to the cache: the flush-back worker, and
//! a read-ahead worker that consumes prefetch requests queued by
//! [`BufferCache::request_read_ahead`] and pulls the named sectors into the
//! cache ahead of demand.
//!
//! One global mutex serializes every cache operation, including the disk
//! transfer performed while holding it. The operations are coarse-grained
//! by design; the mutex simply queues threads in front of the device.
use crossbeam_queue::SegQueue;
use mica::dev::{Disk, SECTOR_SIZE, Sector};
use mica::sync::{Mutex, Semaphore};
use mica::thread::{self, ThreadBuilder};
use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

/// Number of cache entries.
pub const CACHE_SIZE: usize = 64;

const FLUSH_BACK_INTERVAL_MS: u64 = 500;

struct Entry {
    in_use: bool,
    sector: Sector,
    dirty: bool,
    accessed: bool,
    data: [u8; SECTOR_SIZE],
}

impl Entry {
    const EMPTY: Entry = Entry {
        in_use: false,
        sector: Sector(0),
        dirty: false,
        accessed: false,
        data: [0; SECTOR_SIZE],
    };
}

struct CacheState {
    entries: Box<[Entry; CACHE_SIZE]>,
    cursor: usize,
}

struct ReadAhead {
    queue: SegQueue<Sector>,
    pending: Semaphore,
    shutdown: AtomicBool,
}

/// The write-back sector cache over the file-system disk.
pub struct BufferCache {
    disk: Disk,
    state: Mutex<CacheState>,
    read_ahead: Arc<ReadAhead>,
}

impl BufferCache {
    /// Creates a cache over `disk` and spawns its two workers.
    pub fn new(disk: Disk) -> Arc<Self> {
        let cache = Arc::new(Self {
            disk,
            state: Mutex::new(CacheState {
                entries: Box::new([Entry::EMPTY; CACHE_SIZE]),
                cursor: 0,
            }),
            read_ahead: Arc::new(ReadAhead {
                queue: SegQueue::new(),
                pending: Semaphore::new(0),
                shutdown: AtomicBool::new(false),
            }),
        });

        let weak = Arc::downgrade(&cache);
        ThreadBuilder::new("cache-flush-back").spawn(move || {
            loop {
                thread::sleep_ms(FLUSH_BACK_INTERVAL_MS);
                match weak.upgrade() {
                    Some(cache) => cache.flush_all(),
                    None => break,
                }
            }
        });

        let weak = Arc::downgrade(&cache);
        let read_ahead = cache.read_ahead.clone();
        ThreadBuilder::new("cache-read-ahead").spawn(move || {
            loop {
                read_ahead.pending.wait();
                if read_ahead.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let Some(sector) = read_ahead.queue.pop() else {
                    continue;
                };
                match weak.upgrade() {
                    Some(cache) => cache.prefetch(sector),
                    None => break,
                }
            }
            log::debug!("cache read-ahead worker stopped");
        });

        cache
    }

    /// Returns the index of the entry caching `sector`, fetching it first
    /// if absent.
    ///
    /// A fetch grabs an unused slot, or evicts one by the clock policy
    /// (flushing the victim if dirty). When `read` is set the sector is
    /// read from disk into the slot; otherwise the entry's bytes are
    /// unspecified and the caller must overwrite them before anyone reads.
    fn fetch(&self, state: &mut CacheState, sector: Sector, read: bool) -> usize {
        if let Some(idx) =
            (0..CACHE_SIZE).find(|&i| state.entries[i].in_use && state.entries[i].sector == sector)
        {
            return idx;
        }

        let idx = match (0..CACHE_SIZE).find(|&i| !state.entries[i].in_use) {
            Some(idx) => idx,
            None => {
                let idx = loop {
                    let cursor = state.cursor;
                    state.cursor = (state.cursor + 1) % CACHE_SIZE;
                    let entry = &mut state.entries[cursor];
                    if entry.accessed {
                        entry.accessed = false;
                    } else {
                        break cursor;
                    }
                };
                let entry = &state.entries[idx];
                if entry.dirty {
                    let _ = self.disk.write(entry.sector, &entry.data);
                }
                idx
            }
        };

        let entry = &mut state.entries[idx];
        entry.in_use = true;
        entry.sector = sector;
        entry.dirty = false;
        entry.accessed = false;
        if read {
            let _ = self.disk.read(sector, &mut entry.data);
        }
        idx
    }

    /// Reads the whole of `sector` into `dst`.
    pub fn read(&self, sector: Sector, dst: &mut [u8; SECTOR_SIZE]) {
        self.copy_out(sector, dst, 0);
    }

    /// Reads `dst.len()` bytes of `sector` starting at byte `ofs`.
    pub fn copy_out(&self, sector: Sector, dst: &mut [u8], ofs: usize) {
        assert!(ofs + dst.len() <= SECTOR_SIZE);
        let mut state = self.state.lock();
        let idx = self.fetch(&mut state, sector, true);
        let entry = &mut state.entries[idx];
        dst.copy_from_slice(&entry.data[ofs..ofs + dst.len()]);
        entry.accessed = true;
    }

    /// Overwrites the whole of `sector` from `src`.
    ///
    /// The sector is not read from disk first: the entry is fetched
    /// write-only and fully overwritten here.
    pub fn write(&self, sector: Sector, src: &[u8; SECTOR_SIZE]) {
        let mut state = self.state.lock();
        let idx = self.fetch(&mut state, sector, false);
        let entry = &mut state.entries[idx];
        entry.data.copy_from_slice(src);
        entry.dirty = true;
        entry.accessed = true;
    }

    /// Overwrites `src.len()` bytes of `sector` starting at byte `ofs`.
    ///
    /// Unlike [`BufferCache::write`], a partial update must read the sector
    /// first so the untouched bytes survive.
    pub fn copy_in(&self, sector: Sector, src: &[u8], ofs: usize) {
        assert!(ofs + src.len() <= SECTOR_SIZE);
        let mut state = self.state.lock();
        let idx = self.fetch(&mut state, sector, true);
        let entry = &mut state.entries[idx];
        entry.data[ofs..ofs + src.len()].copy_from_slice(src);
        entry.dirty = true;
        entry.accessed = true;
    }

    /// Drops the entry caching `sector`, flushing it first if dirty.
    pub fn invalidate(&self, sector: Sector) {
        let mut state = self.state.lock();
        if let Some(idx) =
            (0..CACHE_SIZE).find(|&i| state.entries[i].in_use && state.entries[i].sector == sector)
        {
            let entry = &mut state.entries[idx];
            if entry.dirty {
                let _ = self.disk.write(entry.sector, &entry.data);
            }
            entry.in_use = false;
        }
    }

    /// Writes every dirty entry to disk.
    pub fn flush_all(&self) {
        let mut state = self.state.lock();
        for entry in state.entries.iter_mut() {
            if entry.in_use && entry.dirty {
                let _ = self.disk.write(entry.sector, &entry.data);
                entry.dirty = false;
            }
        }
    }

    /// Enqueues an asynchronous prefetch of `sector`.
    ///
    /// The read-ahead worker will pull the sector into the cache; a later
    /// demand read then hits without touching the disk.
    pub fn request_read_ahead(&self, sector: Sector) {
        self.read_ahead.queue.push(sector);
        self.read_ahead.pending.signal();
    }

    fn prefetch(&self, sector: Sector) {
        let mut state = self.state.lock();
        self.fetch(&mut state, sector, true);
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        self.read_ahead.shutdown.store(true, Ordering::SeqCst);
        self.read_ahead.pending.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mica::dev::MemDisk;
    use std::sync::atomic::AtomicUsize;

    fn counting_disk(sectors: u32) -> (Disk, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let writes = Arc::new(AtomicUsize::new(0));
        let (r, w) = (reads.clone(), writes.clone());
        let disk = Disk::new(MemDisk::new(sectors)).hook(Arc::new(move |_, _, is_write| {
            if is_write {
                w.fetch_add(1, Ordering::SeqCst);
            } else {
                r.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }));
        (disk, reads, writes)
    }

    fn sector_of(byte: u8) -> [u8; SECTOR_SIZE] {
        [byte; SECTOR_SIZE]
    }

    #[test]
    fn repeated_reads_hit_the_cache() {
        let (disk, reads, _) = counting_disk(16);
        let cache = BufferCache::new(disk);

        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(Sector(3), &mut buf);
        cache.read(Sector(3), &mut buf);
        cache.read(Sector(3), &mut buf);
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn writes_are_deferred_until_flush() {
        let (disk, _, writes) = counting_disk(16);
        let cache = BufferCache::new(disk.clone());

        cache.write(Sector(5), &sector_of(0x42));
        assert_eq!(writes.load(Ordering::SeqCst), 0);

        cache.flush_all();
        assert_eq!(writes.load(Ordering::SeqCst), 1);
        let mut on_disk = [0u8; SECTOR_SIZE];
        disk.read(Sector(5), &mut on_disk).unwrap();
        assert_eq!(on_disk, sector_of(0x42));

        // A second flush has nothing left to write.
        cache.flush_all();
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn partial_update_preserves_the_rest_of_the_sector() {
        let (disk, _, _) = counting_disk(16);
        disk.write(Sector(7), &sector_of(0x11)).unwrap();
        let cache = BufferCache::new(disk.clone());

        cache.copy_in(Sector(7), &[0xee; 16], 100);
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(Sector(7), &mut buf);
        assert!(buf[..100].iter().all(|&b| b == 0x11));
        assert!(buf[100..116].iter().all(|&b| b == 0xee));
        assert!(buf[116..].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn eviction_flushes_dirty_victims() {
        let (disk, _, _) = counting_disk(256);
        let cache = BufferCache::new(disk.clone());

        // Dirty every entry, then stream reads through the whole cache to
        // force evictions of all of them.
        for i in 0..CACHE_SIZE as u32 {
            cache.write(Sector(i), &sector_of(i as u8));
        }
        let mut buf = [0u8; SECTOR_SIZE];
        for i in CACHE_SIZE as u32..3 * CACHE_SIZE as u32 {
            cache.read(Sector(i), &mut buf);
        }

        for i in 0..CACHE_SIZE as u32 {
            let mut on_disk = [0u8; SECTOR_SIZE];
            disk.read(Sector(i), &mut on_disk).unwrap();
            assert_eq!(on_disk, sector_of(i as u8), "sector {i} lost on eviction");
        }
    }

    #[test]
    fn invalidate_flushes_and_forgets() {
        let (disk, reads, writes) = counting_disk(16);
        let cache = BufferCache::new(disk);

        cache.write(Sector(2), &sector_of(0x77));
        cache.invalidate(Sector(2));
        assert_eq!(writes.load(Ordering::SeqCst), 1);

        // Gone from the cache: the next read goes to disk.
        let before = reads.load(Ordering::SeqCst);
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(Sector(2), &mut buf);
        assert_eq!(buf, sector_of(0x77));
        assert_eq!(reads.load(Ordering::SeqCst), before + 1);

        // Invalidating an absent sector is a no-op.
        cache.invalidate(Sector(9));
    }

    #[test]
    fn read_ahead_makes_the_demand_read_free() {
        let (disk, reads, _) = counting_disk(16);
        disk.write(Sector(9), &sector_of(0x5a)).unwrap();
        let cache = BufferCache::new(disk);

        cache.request_read_ahead(Sector(9));
        // Give the worker time to service the request.
        for _ in 0..200 {
            if reads.load(Ordering::SeqCst) > 0 {
                break;
            }
            thread::sleep_ms(5);
        }
        assert_eq!(reads.load(Ordering::SeqCst), 1, "worker did not prefetch");

        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(Sector(9), &mut buf);
        assert_eq!(buf, sector_of(0x5a));
        assert_eq!(reads.load(Ordering::SeqCst), 1, "demand read hit the disk");
    }
}

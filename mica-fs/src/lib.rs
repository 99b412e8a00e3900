//! The Mica file system.
//!
//! A Unix-style file system over a 512-byte-sector block device. The
//! pieces, bottom up:
//!
//! - [`free_map`]: the persistent bitmap of sector allocations.
//! - [`cache`]: the 64-entry write-back buffer cache every other layer
//!   reads and writes through.
//! - [`inode`]: on-disk inodes with direct, indirect and double-indirect
//!   pointer blocks.
//! - [`dir`]: the single flat root directory.
//! - [`file`]: open-file handles with independent positions.
//!
//! [`Fs`] ties them together: it owns the cache, the free map and the
//! table of open inodes, and exposes the name-level operations
//! ([`Fs::create`], [`Fs::open`], [`Fs::remove`]).
//!
//! Sectors 0 and 1 of the volume are reserved: sector 0 holds the inode of
//! the free-map file and sector 1 the inode of the root directory.
pub mod cache;
pub mod dir;
pub mod file;
pub mod free_map;
pub mod inode;

use crate::cache::BufferCache;
use crate::dir::Dir;
use crate::file::File;
use crate::free_map::FreeMap;
use crate::inode::{Inode, InodeInner};
use mica::KernelError;
use mica::dev::{Disk, Sector};
use mica::sync::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Sector of the free-map inode.
pub const FREE_MAP_SECTOR: Sector = Sector(0);
/// Sector of the root-directory inode.
pub const ROOT_DIR_SECTOR: Sector = Sector(1);

pub(crate) type InodeTable = BTreeMap<u32, Arc<InodeInner>>;

/// A mounted file system.
pub struct Fs {
    cache: Arc<BufferCache>,
    free_map: Mutex<FreeMap>,
    free_map_inode: Mutex<Option<Inode>>,
    open_inodes: Mutex<InodeTable>,
}

impl Fs {
    fn assemble(disk: Disk) -> Fs {
        Fs {
            cache: BufferCache::new(disk.clone()),
            free_map: Mutex::new(FreeMap::new(disk.size())),
            free_map_inode: Mutex::new(None),
            open_inodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Formats `disk` with a fresh file system and mounts it.
    ///
    /// Lays down the free-map file at sector 0 and an empty root directory
    /// at sector 1.
    pub fn format(disk: Disk) -> Result<Fs, KernelError> {
        log::info!("formatting volume of {} sectors", disk.size());
        let fs = Fs::assemble(disk);

        let byte_len = fs.free_map.lock().byte_len();
        inode::create(&fs, FREE_MAP_SECTOR, byte_len)?;
        *fs.free_map_inode.lock() = Some(fs.open_inode(FREE_MAP_SECTOR));

        Dir::create_root(&fs)?;
        fs.persist_free_map(&fs.free_map.lock());
        Ok(fs)
    }

    /// Mounts the file system already present on `disk`.
    pub fn mount(disk: Disk) -> Result<Fs, KernelError> {
        let fs = Fs::assemble(disk);

        let fm_inode = fs.open_inode(FREE_MAP_SECTOR);
        let mut map = fs.free_map.lock();
        let mut bytes = vec![0u8; map.byte_len()];
        if fm_inode.read_at(&fs, &mut bytes, 0) != bytes.len() {
            return Err(KernelError::FilesystemCorrupted("short free map"));
        }
        map.load_bytes(&bytes);
        map.unlock();

        *fs.free_map_inode.lock() = Some(fm_inode);
        log::info!("mounted file system");
        Ok(fs)
    }

    pub(crate) fn cache(&self) -> &BufferCache {
        &self.cache
    }

    pub(crate) fn inode_table(&self) -> MutexGuard<'_, InodeTable> {
        self.open_inodes.lock()
    }

    /// Opens the inode stored at `sector`.
    pub fn open_inode(&self, sector: Sector) -> Inode {
        let mut table = self.open_inodes.lock();
        inode::open(self, &mut table, sector)
    }

    /// Creates a file of `initial_size` zero bytes named `name`.
    pub fn create(&self, name: &str, initial_size: usize) -> Result<(), KernelError> {
        let root = Dir::open_root(self);
        let result = self.create_in(&root, name, initial_size);
        root.close(self);
        result
    }

    fn create_in(&self, root: &Dir, name: &str, initial_size: usize) -> Result<(), KernelError> {
        let inode_sector = self.fm_allocate(1).ok_or(KernelError::NoSpace)?;
        if let Err(e) = inode::create(self, inode_sector, initial_size) {
            self.fm_release(inode_sector, 1);
            return Err(e);
        }
        if let Err(e) = root.add(self, name, inode_sector) {
            // Undo the creation: reclaim the data and the inode sector.
            let inode = self.open_inode(inode_sector);
            inode.remove();
            inode.close(self);
            return Err(e);
        }
        Ok(())
    }

    /// Opens the file named `name`.
    pub fn open(&self, name: &str) -> Result<File, KernelError> {
        let root = Dir::open_root(self);
        let sector = root.lookup(self, name);
        root.close(self);
        Ok(File::new(
            self.open_inode(sector.ok_or(KernelError::NoSuchEntry)?),
        ))
    }

    /// Removes the file named `name`.
    ///
    /// Open handles stay usable; the file's sectors are reclaimed on the
    /// last close.
    pub fn remove(&self, name: &str) -> Result<(), KernelError> {
        let root = Dir::open_root(self);
        let result = root.remove(self, name);
        root.close(self);
        result
    }

    /// Writes every dirty cache entry to disk.
    pub fn flush(&self) {
        self.cache.flush_all();
    }

    /// Number of sectors the free map counts as used.
    pub fn used_sectors(&self) -> usize {
        self.free_map.lock().used_count()
    }

    /// Number of inodes currently open.
    pub fn open_inode_count(&self) -> usize {
        self.open_inodes.lock().len()
    }

    pub(crate) fn fm_allocate(&self, cnt: usize) -> Option<Sector> {
        let mut map = self.free_map.lock();
        let sector = map.allocate(cnt)?;
        self.persist_free_map(&map);
        Some(sector)
    }

    pub(crate) fn fm_allocate_decreasing(
        &self,
        remaining: &mut usize,
        chunk: usize,
    ) -> Option<(Sector, usize)> {
        let mut map = self.free_map.lock();
        let run = map.allocate_decreasing(remaining, chunk)?;
        self.persist_free_map(&map);
        Some(run)
    }

    pub(crate) fn fm_release(&self, sector: Sector, cnt: usize) {
        let mut map = self.free_map.lock();
        map.release(sector, cnt);
        self.persist_free_map(&map);
    }

    /// Writes the free map back to its file.
    ///
    /// A no-op during format, before the free-map file exists; the map is
    /// persisted explicitly once it does. The write never grows the file,
    /// so it cannot recurse into the free map.
    fn persist_free_map(&self, map: &FreeMap) {
        if let Some(inode) = self.free_map_inode.lock().as_ref() {
            let bytes = map.to_bytes();
            let n = inode.write_at(self, &bytes, 0);
            debug_assert_eq!(n, bytes.len());
        }
    }
}

impl Drop for Fs {
    fn drop(&mut self) {
        self.cache.flush_all();
    }
}

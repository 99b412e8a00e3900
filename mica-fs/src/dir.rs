//! The root directory.
//!
//! Mica has exactly one directory: a flat table of fixed-size entries
//! stored in the inode at sector 1. Each entry maps a short name to the
//! sector of the file's inode. There are no subdirectories.
use crate::{Fs, ROOT_DIR_SECTOR, inode, inode::Inode};
use mica::KernelError;
use mica::const_assert;
use mica::dev::Sector;

/// Longest file name the directory can store, in bytes.
pub const NAME_MAX: usize = 14;

const ENTRY_SIZE: usize = 20;
const ROOT_ENTRY_COUNT: usize = 64;

/// One directory entry: an inode pointer and a name.
#[repr(C)]
#[derive(Clone, Copy)]
struct DirEntry {
    sector: u32,
    in_use: u8,
    name_len: u8,
    name: [u8; NAME_MAX],
}
const_assert!(size_of::<DirEntry>() == ENTRY_SIZE);

impl DirEntry {
    fn empty() -> Self {
        DirEntry {
            sector: 0,
            in_use: 0,
            name_len: 0,
            name: [0; NAME_MAX],
        }
    }

    fn named(name: &str, sector: Sector) -> Self {
        let mut entry = DirEntry {
            sector: sector.0,
            in_use: 1,
            name_len: name.len() as u8,
            name: [0; NAME_MAX],
        };
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry
    }

    fn matches(&self, name: &str) -> bool {
        self.in_use != 0
            && self.name_len as usize == name.len()
            && &self.name[..name.len()] == name.as_bytes()
    }

    fn as_bytes(&self) -> &[u8; ENTRY_SIZE] {
        unsafe { &*(self as *const DirEntry as *const [u8; ENTRY_SIZE]) }
    }

    fn from_bytes(bytes: &[u8; ENTRY_SIZE]) -> Self {
        unsafe { (bytes.as_ptr() as *const DirEntry).read_unaligned() }
    }
}

/// A handle to the root directory.
pub struct Dir {
    inode: Inode,
}

impl Dir {
    /// Creates the root directory inode during format.
    pub(crate) fn create_root(fs: &Fs) -> Result<(), KernelError> {
        inode::create(fs, ROOT_DIR_SECTOR, ROOT_ENTRY_COUNT * ENTRY_SIZE)
    }

    /// Opens the root directory.
    pub fn open_root(fs: &Fs) -> Dir {
        Dir {
            inode: fs.open_inode(ROOT_DIR_SECTOR),
        }
    }

    /// Closes the directory handle.
    pub fn close(self, fs: &Fs) {
        self.inode.close(fs);
    }

    fn entry_count(&self) -> usize {
        self.inode.length() / ENTRY_SIZE
    }

    fn entry_at(&self, fs: &Fs, idx: usize) -> Option<DirEntry> {
        let mut bytes = [0u8; ENTRY_SIZE];
        if self.inode.read_at(fs, &mut bytes, idx * ENTRY_SIZE) == ENTRY_SIZE {
            Some(DirEntry::from_bytes(&bytes))
        } else {
            None
        }
    }

    fn write_entry(&self, fs: &Fs, idx: usize, entry: &DirEntry) -> bool {
        self.inode.write_at(fs, entry.as_bytes(), idx * ENTRY_SIZE) == ENTRY_SIZE
    }

    /// Looks up `name`, returning the sector of its inode.
    pub fn lookup(&self, fs: &Fs, name: &str) -> Option<Sector> {
        (0..self.entry_count()).find_map(|idx| {
            let entry = self.entry_at(fs, idx)?;
            entry.matches(name).then_some(Sector(entry.sector))
        })
    }

    /// Binds `name` to the inode at `sector`.
    ///
    /// The entry goes into the first unused slot, or is appended past the
    /// current end of the directory (growing its inode) when all slots are
    /// taken.
    pub(crate) fn add(&self, fs: &Fs, name: &str, sector: Sector) -> Result<(), KernelError> {
        if name.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        if name.len() > NAME_MAX {
            return Err(KernelError::NameTooLong);
        }
        if self.lookup(fs, name).is_some() {
            return Err(KernelError::FileExist);
        }

        let slot = (0..self.entry_count())
            .find(|&idx| {
                self.entry_at(fs, idx)
                    .map(|entry| entry.in_use == 0)
                    .unwrap_or(false)
            })
            .unwrap_or_else(|| self.entry_count());

        if self.write_entry(fs, slot, &DirEntry::named(name, sector)) {
            Ok(())
        } else {
            Err(KernelError::NoSpace)
        }
    }

    /// Unbinds `name` and marks its inode for deletion.
    ///
    /// The file's sectors are reclaimed when the last open handle closes.
    pub(crate) fn remove(&self, fs: &Fs, name: &str) -> Result<(), KernelError> {
        let idx = (0..self.entry_count())
            .find(|&idx| {
                self.entry_at(fs, idx)
                    .map(|entry| entry.matches(name))
                    .unwrap_or(false)
            })
            .ok_or(KernelError::NoSuchEntry)?;
        let entry = self.entry_at(fs, idx).unwrap();

        let inode = fs.open_inode(Sector(entry.sector));
        inode.remove();
        inode.close(fs);

        self.write_entry(fs, idx, &DirEntry::empty());
        Ok(())
    }
}

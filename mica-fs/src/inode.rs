//! The inode store.
//!
//! An on-disk inode occupies exactly one sector and indexes its data
//! through 12 direct pointers, 2 single-indirect blocks of 128 pointers,
//! and one double-indirect block of 128 indirect blocks, for a maximum file
//! size of (12 + 256 + 16384) sectors. All inode I/O, including indirect
//! block walks, goes through the buffer cache; the inode layer never talks
//! to the disk directly.
//!
//! In-memory inodes are deduplicated per sector: opening the same sector
//! twice yields the same inode with a bumped open count. An inode marked
//! removed gives its data sectors and its own sector back to the free map
//! on the final close.
//!
//! Growth is sparse-capable: extending a file allocates and zero-fills
//! every new data sector, laying allocations out with the free map's
//! decreasing-contiguity allocator. An extension that runs out of sectors
//! rolls back completely: every sector the call allocated (data, indirect
//! and double-indirect blocks alike) is released and the length is left
//! untouched.
use crate::{Fs, InodeTable};
use mica::const_assert;
use mica::dev::{SECTOR_SIZE, Sector};
use mica::sync::Mutex;
use mica::KernelError;
use std::sync::Arc;

/// Number of direct sector pointers in an inode.
pub const DIRECT_COUNT: usize = 12;
/// Number of single-indirect pointers in an inode.
pub const INDIRECT_COUNT: usize = 2;
/// Number of sector pointers held by one indirect block.
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / size_of::<u32>();

/// Largest number of data sectors a single inode can index.
pub const MAX_SECTORS: usize =
    DIRECT_COUNT + INDIRECT_COUNT * PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR;
/// Largest file size in bytes.
pub const MAX_LENGTH: usize = MAX_SECTORS * SECTOR_SIZE;

/// Identifies an inode sector.
pub const INODE_MAGIC: u32 = 0x494e4f44;

/// The null sector pointer. Sector 0 holds the free-map inode and can
/// never be a data or indirect block, so a zeroed pointer is "absent".
const NO_SECTOR: u32 = 0;

const ZERO_SECTOR: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];

/// Returns the number of sectors needed for `len` bytes of data.
fn bytes_to_sectors(len: usize) -> usize {
    len.div_ceil(SECTOR_SIZE)
}

/// On-disk inode. Must be exactly one sector long.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct InodeDisk {
    /// Directly mapped data sectors.
    direct: [u32; DIRECT_COUNT],
    /// Single-indirect blocks, each a sector of 128 data pointers.
    indirect: [u32; INDIRECT_COUNT],
    /// Double-indirect block, a sector of 128 indirect-block pointers.
    double_indirect: u32,
    /// File size in bytes.
    length: i32,
    /// Magic number.
    magic: u32,
    /// Not used.
    unused: [u32; 111],
}
const_assert!(size_of::<InodeDisk>() == SECTOR_SIZE);

impl InodeDisk {
    fn new() -> Self {
        InodeDisk {
            direct: [NO_SECTOR; DIRECT_COUNT],
            indirect: [NO_SECTOR; INDIRECT_COUNT],
            double_indirect: NO_SECTOR,
            length: 0,
            magic: INODE_MAGIC,
            unused: [0; 111],
        }
    }

    fn as_bytes(&self) -> &[u8; SECTOR_SIZE] {
        unsafe { &*(self as *const InodeDisk as *const [u8; SECTOR_SIZE]) }
    }

    fn from_bytes(bytes: &[u8; SECTOR_SIZE]) -> Self {
        unsafe { (bytes.as_ptr() as *const InodeDisk).read_unaligned() }
    }

    fn sectors(&self) -> usize {
        bytes_to_sectors(self.length as usize)
    }
}

/// An indirect block: one sector of sector pointers.
#[repr(C)]
#[derive(Clone, Copy)]
struct IndirectBlock {
    ptrs: [u32; PTRS_PER_SECTOR],
}
const_assert!(size_of::<IndirectBlock>() == SECTOR_SIZE);

impl IndirectBlock {
    fn zeroed() -> Self {
        IndirectBlock {
            ptrs: [NO_SECTOR; PTRS_PER_SECTOR],
        }
    }

    fn as_bytes(&self) -> &[u8; SECTOR_SIZE] {
        unsafe { &*(self as *const IndirectBlock as *const [u8; SECTOR_SIZE]) }
    }

    fn read(fs: &Fs, sector: Sector) -> Self {
        let mut bytes = [0u8; SECTOR_SIZE];
        fs.cache().read(sector, &mut bytes);
        unsafe { (bytes.as_ptr() as *const IndirectBlock).read_unaligned() }
    }
}

pub(crate) struct InodeState {
    pub(crate) open_cnt: usize,
    pub(crate) deny_write_cnt: usize,
    pub(crate) removed: bool,
    pub(crate) disk: InodeDisk,
}

pub(crate) struct InodeInner {
    pub(crate) sector: Sector,
    pub(crate) state: Mutex<InodeState>,
}

/// An open handle to an in-memory inode.
///
/// Handles to the same sector share one in-memory inode; the handle count
/// is the inode's open count. Handles are duplicated with
/// [`Inode::reopen`] and must be returned with [`Inode::close`].
pub struct Inode(pub(crate) Arc<InodeInner>);

/// Initializes an inode of `length` zero bytes at `sector`.
///
/// Reserves every data sector (and the indirect blocks they need) up
/// front, zero-fills them through the cache, and writes the inode image to
/// `sector`. Fails without leaving anything allocated if the free map
/// cannot cover the request.
pub(crate) fn create(fs: &Fs, sector: Sector, length: usize) -> Result<(), KernelError> {
    let mut disk = InodeDisk::new();
    if length > 0 && !extend_disk(fs, &mut disk, sector, length) {
        return Err(KernelError::NoSpace);
    }
    fs.cache().write(sector, disk.as_bytes());
    Ok(())
}

/// Opens the inode stored at `sector`.
///
/// If the inode is already open the existing in-memory inode is returned
/// with its open count incremented. Panics if the sector does not carry an
/// inode magic; that means the caller handed us a corrupt pointer.
pub(crate) fn open(fs: &Fs, table: &mut InodeTable, sector: Sector) -> Inode {
    if let Some(inner) = table.get(&sector.0) {
        inner.state.lock().open_cnt += 1;
        return Inode(inner.clone());
    }

    let mut bytes = [0u8; SECTOR_SIZE];
    fs.cache().read(sector, &mut bytes);
    let disk = InodeDisk::from_bytes(&bytes);
    assert_eq!(
        disk.magic,
        INODE_MAGIC,
        "sector {} does not hold an inode",
        sector.0
    );

    let inner = Arc::new(InodeInner {
        sector,
        state: Mutex::new(InodeState {
            open_cnt: 1,
            deny_write_cnt: 0,
            removed: false,
            disk,
        }),
    });
    table.insert(sector.0, inner.clone());
    Inode(inner)
}

impl Inode {
    /// The sector this inode lives in, which doubles as its identity.
    pub fn sector(&self) -> Sector {
        self.0.sector
    }

    /// Duplicates the handle, incrementing the open count.
    pub fn reopen(&self) -> Inode {
        self.0.state.lock().open_cnt += 1;
        Inode(self.0.clone())
    }

    /// The length of the inode's data in bytes.
    pub fn length(&self) -> usize {
        self.0.state.lock().disk.length as usize
    }

    /// Number of handles currently open on this inode.
    pub fn open_count(&self) -> usize {
        self.0.state.lock().open_cnt
    }

    /// Number of outstanding write denials.
    pub fn deny_write_count(&self) -> usize {
        self.0.state.lock().deny_write_cnt
    }

    /// Marks the inode to be deleted when the last handle closes.
    pub fn remove(&self) {
        self.0.state.lock().removed = true;
    }

    /// Disables writes to the inode. May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut state = self.0.state.lock();
        state.deny_write_cnt += 1;
        assert!(state.deny_write_cnt <= state.open_cnt);
    }

    /// Re-enables writes. Must pair with a previous [`Inode::deny_write`]
    /// by the same opener, before that opener closes the inode.
    pub fn allow_write(&self) {
        let mut state = self.0.state.lock();
        assert!(state.deny_write_cnt > 0);
        assert!(state.deny_write_cnt <= state.open_cnt);
        state.deny_write_cnt -= 1;
    }

    /// Closes the handle.
    ///
    /// On the final close the cached inode sector is invalidated, and a
    /// removed inode releases its data sectors and its own sector.
    pub fn close(self, fs: &Fs) {
        let mut table = fs.inode_table();
        let mut state = self.0.state.lock();
        state.open_cnt -= 1;
        if state.open_cnt > 0 {
            return;
        }

        fs.cache().invalidate(self.0.sector);
        table.remove(&self.0.sector.0);
        if state.removed {
            fs.fm_release(self.0.sector, 1);
            release_all(fs, &state.disk);
        }
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset`.
    ///
    /// Returns the number of bytes actually read, which stops short at end
    /// of file.
    pub fn read_at(&self, fs: &Fs, buf: &mut [u8], mut offset: usize) -> usize {
        let state = self.0.state.lock();
        let length = state.disk.length as usize;
        let mut bytes_read = 0;

        while bytes_read < buf.len() && offset < length {
            let sector = sector_for(fs, &state.disk, offset / SECTOR_SIZE);
            let sector_ofs = offset % SECTOR_SIZE;

            let inode_left = length - offset;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (buf.len() - bytes_read).min(inode_left).min(sector_left);

            fs.cache()
                .copy_out(sector, &mut buf[bytes_read..bytes_read + chunk], sector_ofs);

            offset += chunk;
            bytes_read += chunk;
        }
        bytes_read
    }

    /// Writes `buf` starting at byte `offset`, extending the inode to
    /// cover the write.
    ///
    /// Returns the number of bytes written: `buf.len()` normally, or 0
    /// when writes are denied or the extension cannot be satisfied.
    pub fn write_at(&self, fs: &Fs, buf: &[u8], mut offset: usize) -> usize {
        let mut state = self.0.state.lock();
        if state.deny_write_cnt > 0 {
            return 0;
        }

        if !extend_disk(fs, &mut state.disk, self.0.sector, offset + buf.len()) {
            return 0;
        }

        let length = state.disk.length as usize;
        let mut bytes_written = 0;
        while bytes_written < buf.len() && offset < length {
            let sector = sector_for(fs, &state.disk, offset / SECTOR_SIZE);
            let sector_ofs = offset % SECTOR_SIZE;

            let inode_left = length - offset;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (buf.len() - bytes_written).min(inode_left).min(sector_left);

            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                fs.cache().write(
                    sector,
                    (&buf[bytes_written..bytes_written + SECTOR_SIZE])
                        .try_into()
                        .unwrap(),
                );
            } else {
                fs.cache()
                    .copy_in(sector, &buf[bytes_written..bytes_written + chunk], sector_ofs);
            }

            offset += chunk;
            bytes_written += chunk;
        }
        bytes_written
    }
}

/// Returns the disk sector holding the `sector_index`-th data sector.
///
/// The pointer must be mapped; callers guarantee that by staying below the
/// inode's length.
fn sector_for(fs: &Fs, disk: &InodeDisk, sector_index: usize) -> Sector {
    if sector_index < DIRECT_COUNT {
        return Sector(disk.direct[sector_index]);
    }
    let mut ofs = sector_index - DIRECT_COUNT;

    if ofs < INDIRECT_COUNT * PTRS_PER_SECTOR {
        let blk = IndirectBlock::read(fs, Sector(disk.indirect[ofs / PTRS_PER_SECTOR]));
        return Sector(blk.ptrs[ofs % PTRS_PER_SECTOR]);
    }
    ofs -= INDIRECT_COUNT * PTRS_PER_SECTOR;

    let dblk = IndirectBlock::read(fs, Sector(disk.double_indirect));
    let blk = IndirectBlock::read(fs, Sector(dblk.ptrs[ofs / PTRS_PER_SECTOR]));
    Sector(blk.ptrs[ofs % PTRS_PER_SECTOR])
}

/// Grows `disk` to hold `new_length` bytes, persisting the image to
/// `inode_sector` on success.
///
/// Returns `false` and changes nothing (neither on disk nor in `disk`)
/// when the request exceeds the format's maximum or the free map runs
/// dry. Every sector allocated by a failed call is released again.
fn extend_disk(fs: &Fs, disk: &mut InodeDisk, inode_sector: Sector, new_length: usize) -> bool {
    if new_length > MAX_LENGTH {
        return false;
    }

    let cur_len = disk.length as usize;
    let cur = bytes_to_sectors(cur_len);
    let tgt = bytes_to_sectors(new_length);

    // No new sector needed; just bump the length.
    if tgt <= cur {
        if cur_len < new_length {
            disk.length = new_length as i32;
            fs.cache().write(inode_sector, disk.as_bytes());
        }
        return true;
    }

    // Grow a scratch copy, journaling every allocation so a failure can
    // hand all of it back.
    let mut work = *disk;
    let mut journal: Vec<Sector> = Vec::new();
    match grow(fs, &mut work, cur, tgt, &mut journal) {
        Ok(()) => {
            work.length = new_length as i32;
            *disk = work;
            fs.cache().write(inode_sector, disk.as_bytes());
            true
        }
        Err(_) => {
            for sector in journal {
                fs.fm_release(sector, 1);
            }
            false
        }
    }
}

/// Allocates data sectors `[idx, tgt)` of `work`, filling the pointer tree
/// region by region: remaining direct slots, then each single-indirect
/// block, then the double-indirect block's sub-blocks. Indirect blocks are
/// allocated lazily when their region is first touched.
fn grow(
    fs: &Fs,
    work: &mut InodeDisk,
    mut idx: usize,
    tgt: usize,
    journal: &mut Vec<Sector>,
) -> Result<(), KernelError> {
    // Direct slots.
    if idx < DIRECT_COUNT {
        let count = tgt.min(DIRECT_COUNT) - idx;
        let sectors = alloc_data(fs, count, journal)?;
        for (k, sector) in sectors.iter().enumerate() {
            work.direct[idx + k] = sector.0;
        }
        idx += count;
    }

    // Single-indirect blocks.
    for i in 0..INDIRECT_COUNT {
        if idx >= tgt {
            return Ok(());
        }
        let base = DIRECT_COUNT + i * PTRS_PER_SECTOR;
        let limit = base + PTRS_PER_SECTOR;
        if idx >= limit {
            continue;
        }

        let (blk_sector, mut blk) = if work.indirect[i] == NO_SECTOR {
            let sector = alloc_meta(fs, journal)?;
            work.indirect[i] = sector.0;
            (sector, IndirectBlock::zeroed())
        } else {
            let sector = Sector(work.indirect[i]);
            (sector, IndirectBlock::read(fs, sector))
        };

        let count = tgt.min(limit) - idx;
        let sectors = alloc_data(fs, count, journal)?;
        for (k, sector) in sectors.iter().enumerate() {
            blk.ptrs[idx - base + k] = sector.0;
        }
        fs.cache().write(blk_sector, blk.as_bytes());
        idx += count;
    }
    if idx >= tgt {
        return Ok(());
    }

    // The double-indirect region.
    let dbase = DIRECT_COUNT + INDIRECT_COUNT * PTRS_PER_SECTOR;
    let (dblk_sector, mut dblk) = if work.double_indirect == NO_SECTOR {
        let sector = alloc_meta(fs, journal)?;
        work.double_indirect = sector.0;
        (sector, IndirectBlock::zeroed())
    } else {
        let sector = Sector(work.double_indirect);
        (sector, IndirectBlock::read(fs, sector))
    };

    for j in 0..PTRS_PER_SECTOR {
        if idx >= tgt {
            break;
        }
        let base = dbase + j * PTRS_PER_SECTOR;
        let limit = base + PTRS_PER_SECTOR;
        if idx >= limit {
            continue;
        }

        let (blk_sector, mut blk) = if dblk.ptrs[j] == NO_SECTOR {
            let sector = alloc_meta(fs, journal)?;
            dblk.ptrs[j] = sector.0;
            (sector, IndirectBlock::zeroed())
        } else {
            let sector = Sector(dblk.ptrs[j]);
            (sector, IndirectBlock::read(fs, sector))
        };

        let count = tgt.min(limit) - idx;
        let sectors = alloc_data(fs, count, journal)?;
        for (k, sector) in sectors.iter().enumerate() {
            blk.ptrs[idx - base + k] = sector.0;
        }
        fs.cache().write(blk_sector, blk.as_bytes());
        idx += count;
    }
    fs.cache().write(dblk_sector, dblk.as_bytes());
    Ok(())
}

/// Allocates `count` data sectors in as few contiguous runs as the free
/// map allows, zero-filling each through the cache.
fn alloc_data(fs: &Fs, count: usize, journal: &mut Vec<Sector>) -> Result<Vec<Sector>, KernelError> {
    let mut out = Vec::with_capacity(count);
    let mut remaining = count;
    let mut chunk = count;
    while remaining > 0 {
        let Some((first, len)) = fs.fm_allocate_decreasing(&mut remaining, chunk) else {
            return Err(KernelError::NoSpace);
        };
        chunk = len;
        for k in 0..len {
            let sector = first + k as u32;
            fs.cache().write(sector, &ZERO_SECTOR);
            journal.push(sector);
            out.push(sector);
        }
    }
    Ok(out)
}

/// Allocates one metadata (indirect) sector.
fn alloc_meta(fs: &Fs, journal: &mut Vec<Sector>) -> Result<Sector, KernelError> {
    let sector = fs.fm_allocate(1).ok_or(KernelError::NoSpace)?;
    journal.push(sector);
    Ok(sector)
}

/// Releases every sector reachable from `disk`: data sectors, indirect
/// blocks, and the double-indirect chain. The inode's own sector is the
/// caller's to release.
fn release_all(fs: &Fs, disk: &InodeDisk) {
    let total = disk.sectors();
    let mut idx = 0;

    let count = total.min(DIRECT_COUNT);
    for k in 0..count {
        fs.fm_release(Sector(disk.direct[k]), 1);
    }
    idx += count;

    for i in 0..INDIRECT_COUNT {
        if idx >= total {
            return;
        }
        let base = DIRECT_COUNT + i * PTRS_PER_SECTOR;
        let limit = base + PTRS_PER_SECTOR;
        let blk_sector = Sector(disk.indirect[i]);
        let blk = IndirectBlock::read(fs, blk_sector);
        let count = total.min(limit) - base;
        for k in 0..count {
            fs.fm_release(Sector(blk.ptrs[k]), 1);
        }
        fs.fm_release(blk_sector, 1);
        idx += count;
    }

    if idx >= total {
        return;
    }
    let dbase = DIRECT_COUNT + INDIRECT_COUNT * PTRS_PER_SECTOR;
    let dblk_sector = Sector(disk.double_indirect);
    let dblk = IndirectBlock::read(fs, dblk_sector);
    let mut j = 0;
    while idx < total {
        let base = dbase + j * PTRS_PER_SECTOR;
        let limit = base + PTRS_PER_SECTOR;
        let blk_sector = Sector(dblk.ptrs[j]);
        let blk = IndirectBlock::read(fs, blk_sector);
        let count = total.min(limit) - base;
        for k in 0..count {
            fs.fm_release(Sector(blk.ptrs[k]), 1);
        }
        fs.fm_release(blk_sector, 1);
        idx += count;
        j += 1;
    }
    fs.fm_release(dblk_sector, 1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_math() {
        assert_eq!(bytes_to_sectors(0), 0);
        assert_eq!(bytes_to_sectors(1), 1);
        assert_eq!(bytes_to_sectors(SECTOR_SIZE), 1);
        assert_eq!(bytes_to_sectors(SECTOR_SIZE + 1), 2);
    }

    #[test]
    fn format_limits() {
        assert_eq!(MAX_SECTORS, 16652);
        assert_eq!(MAX_LENGTH, 16652 * 512);
    }

    #[test]
    fn on_disk_image_round_trips() {
        let mut disk = InodeDisk::new();
        disk.direct[0] = 7;
        disk.length = 1234;
        let restored = InodeDisk::from_bytes(disk.as_bytes());
        assert_eq!(restored.direct[0], 7);
        assert_eq!(restored.length, 1234);
        assert_eq!(restored.magic, INODE_MAGIC);
    }
}

//! Block devices.
//!
//! All persistent storage in Mica sits behind fixed-size sector I/O: the
//! file system device, the swap device, and nothing else. A [`BlockDevice`]
//! owns the actual bytes; a [`Disk`] is the handle the kernel hands around,
//! optionally marked read-only or wrapped with an observation [`Hook`] so
//! tests can count or fail individual transfers.
use crate::{KernelError, sync::Mutex};
use std::sync::Arc;

/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector, the access granularity of a disk.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Sector(pub u32);

impl Sector {
    /// Get the byte offset represented by the sector.
    #[inline]
    pub fn into_offset(self) -> usize {
        self.0 as usize * SECTOR_SIZE
    }

    /// Cast into usize.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0 as usize
    }
}

impl core::ops::Add<u32> for Sector {
    type Output = Self;

    fn add(self, rhs: u32) -> Self {
        Self(self.0 + rhs)
    }
}

/// Uniform sector I/O over an underlying device.
///
/// Implementations must be safe to share between threads; the buffer cache,
/// the swap table and the free map all issue I/O from different threads.
pub trait BlockDevice: Send + Sync {
    /// Number of sectors the device holds.
    fn sector_count(&self) -> u32;

    /// Reads sector `sector` into `buf`.
    fn read_sector(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError>;

    /// Writes `buf` to sector `sector`.
    fn write_sector(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError>;
}

/// A memory-backed block device.
///
/// The substrate's stand-in for a disk: a flat byte store with sector
/// bounds checking. Both the file-system volume and the swap volume of a
/// running system are `MemDisk`s.
pub struct MemDisk {
    sectors: u32,
    bytes: Mutex<Vec<u8>>,
}

impl MemDisk {
    /// Creates a zero-filled device of `sectors` sectors.
    pub fn new(sectors: u32) -> Arc<Self> {
        Arc::new(Self {
            sectors,
            bytes: Mutex::new(vec![0; sectors as usize * SECTOR_SIZE]),
        })
    }
}

impl BlockDevice for MemDisk {
    fn sector_count(&self) -> u32 {
        self.sectors
    }

    fn read_sector(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        if sector.0 >= self.sectors {
            return Err(KernelError::IOError);
        }
        let bytes = self.bytes.lock();
        let ofs = sector.into_offset();
        buf.copy_from_slice(&bytes[ofs..ofs + SECTOR_SIZE]);
        Ok(())
    }

    fn write_sector(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        if sector.0 >= self.sectors {
            return Err(KernelError::IOError);
        }
        let mut bytes = self.bytes.lock();
        let ofs = sector.into_offset();
        bytes[ofs..ofs + SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }
}

/// The type for disk hooking.
///
/// The hook observes every transfer before it reaches the device; the third
/// argument is `true` for writes. Returning an error aborts the transfer.
pub type Hook =
    Arc<dyn Fn(Sector, &[u8; SECTOR_SIZE], bool) -> Result<(), KernelError> + Send + Sync + 'static>;

/// A handle to a block device.
///
/// Cloning the handle shares the underlying device.
#[derive(Clone)]
pub struct Disk {
    dev: Arc<dyn BlockDevice>,
    is_ro: bool,
    hook: Option<Hook>,
}

impl Disk {
    /// Creates a new disk handle over `dev`.
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            is_ro: false,
            hook: None,
        }
    }

    /// Make the disk read-only.
    pub fn ro(self) -> Self {
        Self { is_ro: true, ..self }
    }

    /// Add a hook for the disk.
    pub fn hook(self, hook: Hook) -> Self {
        Self {
            hook: Some(hook),
            ..self
        }
    }

    /// Number of sectors of the underlying device.
    pub fn size(&self) -> u32 {
        self.dev.sector_count()
    }

    /// Read 512 bytes from disk starting from `sector`.
    pub fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, false)?;
        }
        self.dev.read_sector(sector, buf)
    }

    /// Write 512 bytes to disk starting from `sector`.
    pub fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        if self.is_ro {
            Err(KernelError::NotSupportedOperation)
        } else {
            if let Some(hook) = self.hook.as_ref() {
                hook(sector, buf, true)?;
            }
            self.dev.write_sector(sector, buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn read_back_what_was_written() {
        let disk = Disk::new(MemDisk::new(8));
        let mut pattern = [0u8; SECTOR_SIZE];
        for (i, b) in pattern.iter_mut().enumerate() {
            *b = i as u8;
        }
        disk.write(Sector(3), &pattern).unwrap();

        let mut out = [0u8; SECTOR_SIZE];
        disk.read(Sector(3), &mut out).unwrap();
        assert_eq!(out, pattern);
    }

    #[test]
    fn out_of_range_is_io_error() {
        let disk = Disk::new(MemDisk::new(2));
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(disk.read(Sector(2), &mut buf), Err(KernelError::IOError));
    }

    #[test]
    fn read_only_disk_rejects_writes() {
        let disk = Disk::new(MemDisk::new(2)).ro();
        let buf = [0u8; SECTOR_SIZE];
        assert_eq!(
            disk.write(Sector(0), &buf),
            Err(KernelError::NotSupportedOperation)
        );
    }

    #[test]
    fn hook_observes_transfers() {
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = reads.clone();
        let disk = Disk::new(MemDisk::new(2)).hook(Arc::new(move |_, _, is_write| {
            if !is_write {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }));

        let mut buf = [0u8; SECTOR_SIZE];
        disk.read(Sector(0), &mut buf).unwrap();
        disk.read(Sector(1), &mut buf).unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }
}

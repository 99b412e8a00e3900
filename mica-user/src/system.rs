//! System assembly.
//!
//! The storage and memory singletons (file system, user frame pool, swap
//! table, frame table, console) are created once at boot, before any
//! user process exists, and shared by every process for the lifetime of
//! the system. [`SystemBuilder`] wires them up; [`Kernel`] is the handle
//! processes hold.
use mica::KernelError;
use mica::dev::Disk;
use mica::mm::UserPool;
use mica::teletype::Console;
use mica_fs::Fs;
use mica_vm::{FrameTable, SwapTable};
use std::sync::{Arc, atomic::AtomicI32};

/// The assembled system singletons.
pub struct Kernel {
    /// The mounted file system.
    pub fs: Fs,
    /// The physical allocator for user frames.
    pub pool: Arc<UserPool>,
    /// The swap-slot allocator.
    pub swap: Arc<SwapTable>,
    /// The frame table performing eviction.
    pub frames: FrameTable,
    /// The console behind fds 0 and 1.
    pub console: Console,
    pub(crate) next_pid: AtomicI32,
}

impl Kernel {
    /// Flushes all dirty file-system state to disk.
    pub fn shutdown(&self) {
        self.fs.flush();
        log::info!("system shut down");
    }

    pub(crate) fn allocate_pid(&self) -> i32 {
        self.next_pid
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }
}

/// A builder for system configuration settings.
///
/// ```ignore
/// let kernel = SystemBuilder::new()
///     .fs_disk(Disk::new(MemDisk::new(8192)))
///     .swap_disk(Disk::new(MemDisk::new(1024)))
///     .user_frames(64)
///     .build()?;
/// ```
pub struct SystemBuilder {
    fs_disk: Option<Disk>,
    swap_disk: Option<Disk>,
    user_frames: usize,
    format: bool,
}

impl Default for SystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemBuilder {
    /// Creates a builder with a 64-frame user pool and formatting enabled.
    pub fn new() -> Self {
        Self {
            fs_disk: None,
            swap_disk: None,
            user_frames: 64,
            format: true,
        }
    }

    /// Sets the disk holding the file system.
    pub fn fs_disk(mut self, disk: Disk) -> Self {
        self.fs_disk = Some(disk);
        self
    }

    /// Sets the disk used for swap slots.
    pub fn swap_disk(mut self, disk: Disk) -> Self {
        self.swap_disk = Some(disk);
        self
    }

    /// Sets the number of frames in the user pool.
    pub fn user_frames(mut self, frames: usize) -> Self {
        self.user_frames = frames;
        self
    }

    /// Mounts the file system already on the disk instead of formatting.
    pub fn mount_existing(mut self) -> Self {
        self.format = false;
        self
    }

    /// Assembles the system.
    pub fn build(self) -> Result<Arc<Kernel>, KernelError> {
        let fs_disk = self.fs_disk.ok_or(KernelError::InvalidArgument)?;
        let swap_disk = self.swap_disk.ok_or(KernelError::InvalidArgument)?;

        let fs = if self.format {
            Fs::format(fs_disk)?
        } else {
            Fs::mount(fs_disk)?
        };
        let pool = Arc::new(UserPool::new(self.user_frames));
        let swap = Arc::new(SwapTable::new(swap_disk));
        let frames = FrameTable::new(pool.clone(), swap.clone());

        Ok(Arc::new(Kernel {
            fs,
            pool,
            swap,
            frames,
            console: Console::new(),
            next_pid: AtomicI32::new(1),
        }))
    }
}

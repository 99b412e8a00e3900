//! Processes.
//!
//! A [`Process`] bundles the per-process state the storage and memory core
//! cares about: the page directory and supplemental page table, the file
//! descriptor table, the table of memory-mapped regions, the executable's
//! write-protected file handle, and the child records used by exec/wait.
//!
//! File descriptors are minted from a per-process counter starting at 2;
//! 0 and 1 are the console. Mapping ids are minted the same way.
//!
//! Exit releases resources in a fixed order: open files, mmap regions
//! (flushing dirty pages back to their files), the supplemental page
//! table, and finally the hardware page directory, whose frames go back
//! to the user pool. A process whose parent has exited keeps running; its
//! record dies with it.
use crate::loader::{self, LoadInfo};
use crate::system::Kernel;
use mica::KernelError;
use mica::mm::{PAGE_SIZE, PageDirectory, PageRef, USER_CEILING, Va};
use mica::thread::{self, ThreadBuilder};
use mica_fs::file::File;
use mica_vm::SupplPageTable;
use std::collections::BTreeMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering},
};

/// The child finished loading its executable and is running.
const STATUS_RUNNING: u32 = 1 << 0;
/// The child failed to load its executable.
const STATUS_FAIL: u32 = 1 << 1;
/// The child has exited.
const STATUS_EXITED: u32 = 1 << 2;

/// A parent's record of a spawned child.
pub struct ChildRecord {
    /// Process id of the child.
    pub pid: i32,
    status: AtomicU32,
    exit_code: AtomicI32,
    waited: AtomicBool,
}

impl ChildRecord {
    fn new(pid: i32) -> Self {
        Self {
            pid,
            status: AtomicU32::new(0),
            exit_code: AtomicI32::new(-1),
            waited: AtomicBool::new(false),
        }
    }

    fn mark(&self, bit: u32) {
        self.status.fetch_or(bit, Ordering::SeqCst);
    }

    fn has(&self, bit: u32) -> bool {
        self.status.load(Ordering::SeqCst) & bit != 0
    }
}

struct MmapRegion {
    file: Arc<File>,
    base: Va,
    length: usize,
}

/// A user process.
pub struct Process {
    /// Name of the process, printed by the exit line.
    pub name: String,
    /// The system singletons.
    pub kernel: Arc<Kernel>,
    /// The hardware page directory of this process.
    pub pagedir: Arc<PageDirectory>,
    /// The supplemental page table of this process.
    pub pt: SupplPageTable,
    files: BTreeMap<i32, File>,
    next_fd: i32,
    mmaps: BTreeMap<i32, MmapRegion>,
    next_mapid: i32,
    exec_file: Option<Arc<File>>,
    children: Vec<Arc<ChildRecord>>,
    record: Option<Arc<ChildRecord>>,
    exit_code: Option<i32>,
}

impl Process {
    /// Creates a process with empty tables.
    pub fn new(kernel: &Arc<Kernel>, name: &str) -> Process {
        Self::with_record(kernel, name, None)
    }

    fn with_record(kernel: &Arc<Kernel>, name: &str, record: Option<Arc<ChildRecord>>) -> Process {
        let pagedir = Arc::new(PageDirectory::new());
        Process {
            name: name.to_string(),
            kernel: kernel.clone(),
            pagedir: pagedir.clone(),
            pt: SupplPageTable::new(pagedir),
            files: BTreeMap::new(),
            next_fd: 2,
            mmaps: BTreeMap::new(),
            next_mapid: 1,
            exec_file: None,
            children: Vec::new(),
            record,
            exit_code: None,
        }
    }

    /// Whether the process has exited.
    pub fn exited(&self) -> bool {
        self.exit_code.is_some()
    }

    /// The exit code, once the process has exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Loads `cmdline`'s executable into this process's address space.
    ///
    /// Registers the segments and the stack page, builds the argument
    /// stack, and write-protects the executable for the process lifetime.
    pub fn load(&mut self, cmdline: &str) -> Result<LoadInfo, KernelError> {
        loader::load(self, cmdline)
    }

    pub(crate) fn set_exec_file(&mut self, file: Arc<File>) {
        self.exec_file = Some(file);
    }

    /// Resolves a page fault at `va` by materializing the page.
    pub fn handle_page_fault(&self, va: Va) -> Result<(), KernelError> {
        if !va.is_user() {
            return Err(KernelError::BadAddress);
        }
        let kernel = &self.kernel;
        self.pt
            .load(&kernel.fs, &kernel.frames, &kernel.swap, va.page_base())
    }

    /// Installs `file` into the descriptor table, returning its fd.
    pub(crate) fn install_file(&mut self, file: File) -> i32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.files.insert(fd, file);
        fd
    }

    pub(crate) fn file(&self, fd: i32) -> Option<&File> {
        self.files.get(&fd)
    }

    pub(crate) fn file_mut(&mut self, fd: i32) -> Option<&mut File> {
        self.files.get_mut(&fd)
    }

    pub(crate) fn take_file(&mut self, fd: i32) -> Option<File> {
        self.files.remove(&fd)
    }

    /// Spawns a child process running `cmdline`.
    ///
    /// Blocks until the child's loader reports success or failure; a child
    /// that failed to load yields -1, otherwise the child's pid.
    pub fn exec(&mut self, cmdline: &str) -> i32 {
        let Some(name) = cmdline.split_whitespace().next() else {
            return -1;
        };
        let record = Arc::new(ChildRecord::new(self.kernel.allocate_pid()));
        self.children.push(record.clone());

        let kernel = self.kernel.clone();
        let cmdline = cmdline.to_string();
        let child_record = record.clone();
        ThreadBuilder::new(name).spawn(move || {
            let name = cmdline.split_whitespace().next().unwrap().to_string();
            let mut child = Process::with_record(&kernel, &name, Some(child_record.clone()));
            match child.load(&cmdline) {
                Ok(_info) => {
                    child_record.mark(STATUS_RUNNING);
                    // The substrate has no user mode to enter; a loaded
                    // image runs to completion immediately.
                    child.exit(0);
                }
                Err(_) => {
                    child_record.mark(STATUS_FAIL);
                    child.terminate(-1, false);
                }
            }
        });

        while !(record.has(STATUS_RUNNING | STATUS_FAIL | STATUS_EXITED)) {
            thread::yield_now();
        }
        if record.has(STATUS_FAIL) { -1 } else { record.pid }
    }

    /// Waits for child `pid` to exit and returns its exit code.
    ///
    /// Returns -1 for an unknown child or one already waited for.
    pub fn wait(&mut self, pid: i32) -> i32 {
        let Some(pos) = self.children.iter().position(|child| child.pid == pid) else {
            return -1;
        };
        let record = self.children[pos].clone();
        if record.waited.swap(true, Ordering::SeqCst) {
            return -1;
        }
        while !record.has(STATUS_EXITED) {
            thread::yield_now();
        }
        let code = record.exit_code.load(Ordering::SeqCst);
        self.children.remove(pos);
        code
    }

    /// Terminates the process with `code`, printing the exit line.
    pub fn exit(&mut self, code: i32) {
        self.terminate(code, true);
    }

    pub(crate) fn terminate(&mut self, code: i32, print: bool) {
        if self.exit_code.is_some() {
            return;
        }
        self.exit_code = Some(code);
        if print {
            self.kernel
                .console
                .write(format!("{}: exit({})\n", self.name, code).as_bytes());
        }
        log::debug!("{} exits with {}", self.name, code);

        let kernel = self.kernel.clone();
        for (_, file) in std::mem::take(&mut self.files) {
            file.close(&kernel.fs);
        }

        let ids: Vec<i32> = self.mmaps.keys().copied().collect();
        for id in ids {
            let _ = self.munmap(id);
        }

        self.pt.destroy(&kernel.frames, &kernel.swap);
        for kpage in self.pagedir.clear_all() {
            kernel.pool.free_page(kpage);
        }

        if let Some(exec) = self.exec_file.take() {
            if let Ok(file) = Arc::try_unwrap(exec) {
                file.close(&kernel.fs);
            }
        }

        if let Some(record) = &self.record {
            record.exit_code.store(code, Ordering::SeqCst);
            record.mark(STATUS_EXITED);
        }
    }

    /// Maps the file behind `fd` at user address `addr`.
    ///
    /// Fails if `addr` is zero, unaligned or outside the user range, if
    /// the fd is unknown, if the file is empty, or if the region overlaps
    /// an existing mapping. The file is reopened so later closes of `fd`
    /// do not tear the mapping down. Returns the mapping id.
    pub fn mmap(&mut self, fd: i32, addr: usize) -> Result<i32, KernelError> {
        let base = Va(addr);
        if addr == 0 || !base.is_page_aligned() || !base.is_user() {
            return Err(KernelError::InvalidArgument);
        }
        let size = self.file(fd).ok_or(KernelError::BadFileDescriptor)?.size();
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let pages = size.div_ceil(PAGE_SIZE);
        if addr + pages * PAGE_SIZE > USER_CEILING {
            return Err(KernelError::InvalidArgument);
        }

        let kernel = self.kernel.clone();
        let file = Arc::new(self.file(fd).unwrap().reopen());
        for i in 0..pages {
            let upage = base + i * PAGE_SIZE;
            let read_bytes = (size - i * PAGE_SIZE).min(PAGE_SIZE);
            let installed = self.pt.set_file(
                upage,
                file.clone(),
                i * PAGE_SIZE,
                read_bytes,
                PAGE_SIZE - read_bytes,
                true,
                true,
            );
            if let Err(e) = installed {
                // Overlap with an existing mapping: undo what we added.
                for k in 0..i {
                    self.pt
                        .clear_page(&kernel.frames, &kernel.swap, base + k * PAGE_SIZE);
                }
                if let Ok(file) = Arc::try_unwrap(file) {
                    file.close(&kernel.fs);
                }
                return Err(e);
            }
        }

        let id = self.next_mapid;
        self.next_mapid += 1;
        self.mmaps.insert(
            id,
            MmapRegion {
                file,
                base,
                length: size,
            },
        );
        Ok(id)
    }

    /// Unmaps mapping `id`, writing modified pages back to the file.
    ///
    /// Every page of the region is settled: a resident dirty page is
    /// written at its file offset; a swapped-out dirty page is paged back
    /// in, written, and its slot released; anything else is simply
    /// dropped. The reopened file handle is closed at the end.
    pub fn munmap(&mut self, id: i32) -> Result<(), KernelError> {
        let region = self.mmaps.remove(&id).ok_or(KernelError::NoSuchEntry)?;
        let kernel = self.kernel.clone();

        let pages = region.length.div_ceil(PAGE_SIZE);
        for i in 0..pages {
            let upage = region.base + i * PAGE_SIZE;
            let Some(pte) = self.pt.get(upage) else {
                continue;
            };
            let dirty = pte.update_dirty();
            let tail = (region.length - i * PAGE_SIZE).min(PAGE_SIZE);

            if let Some(kpage) = pte.kpage() {
                if dirty {
                    let page = unsafe { PageRef::from_kva(kpage) };
                    region
                        .file
                        .write_at(&kernel.fs, &page.inner()[..tail], i * PAGE_SIZE);
                }
            } else if let Some(slot) = pte.take_swap_slot() {
                if dirty {
                    let mut image = Box::new([0u8; PAGE_SIZE]);
                    if kernel.swap.swap_in(slot, &mut image).is_ok() {
                        region
                            .file
                            .write_at(&kernel.fs, &image[..tail], i * PAGE_SIZE);
                    }
                } else {
                    kernel.swap.release(slot);
                }
            }

            if let Some(kpage) = self.pt.clear_page(&kernel.frames, &kernel.swap, upage) {
                kernel.pool.free_page(kpage);
            }
        }

        let MmapRegion { file, .. } = region;
        if let Ok(file) = Arc::try_unwrap(file) {
            file.close(&kernel.fs);
        }
        Ok(())
    }
}

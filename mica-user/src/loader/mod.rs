//! The address-space loader.
//!
//! Turns an executable file into a runnable address space: every
//! `PT_LOAD` segment becomes a run of file-backed supplemental page-table
//! entries (nothing is read until the pages fault in), one zero page under
//! the user ceiling becomes the stack, and the command line is marshalled
//! onto that stack in the machine's argument layout.
//!
//! The executable itself is write-protected for the process lifetime, so
//! a running program's image cannot be modified underneath it.
//!
//! ## Argument layout
//!
//! With `sp` starting at the user ceiling, `load` pushes, in order: the
//! argument strings (last first, each NUL-terminated); padding down to
//! word alignment; a null `argv[argc]`; the argument pointers
//! `argv[argc-1] … argv[0]`; the address of `argv[0]` (that is, `argv`);
//! `argc`; and a zero placeholder for the return address.
pub mod elf;
pub mod stack_builder;

use crate::process::Process;
use crate::system::Kernel;
use elf::{Elf32Ehdr, Elf32Phdr, PFlags, PT_DYNAMIC, PT_INTERP, PT_LOAD, PT_SHLIB};
use mica::KernelError;
use mica::mm::{PAGE_MASK, PAGE_SIZE, USER_CEILING, Va};
use mica_fs::file::File;
use stack_builder::StackBuilder;
use std::sync::Arc;

/// What a successful load hands back: the program's entry point and its
/// initial stack pointer.
pub struct LoadInfo {
    /// Entry point virtual address.
    pub entry: usize,
    /// Initial stack pointer, below the marshalled arguments.
    pub sp: usize,
}

/// Loads the executable named by `cmdline` into `process`.
pub(crate) fn load(process: &mut Process, cmdline: &str) -> Result<LoadInfo, KernelError> {
    let args: Vec<&str> = cmdline.split_whitespace().collect();
    let name = *args.first().ok_or(KernelError::InvalidArgument)?;
    let kernel = process.kernel.clone();

    let mut file = kernel.fs.open(name)?;
    file.deny_write();
    let file = Arc::new(file);

    // The handle is owned by the process either way: segment entries that
    // were already registered keep references into it, and the exit path
    // knows how to unwind them.
    process.set_exec_file(file.clone());

    let result = load_image(process, &kernel, &file, &args);
    if result.is_err() {
        log::debug!("load of `{name}' failed");
    }
    result
}

fn load_image(
    process: &mut Process,
    kernel: &Arc<Kernel>,
    file: &Arc<File>,
    args: &[&str],
) -> Result<LoadInfo, KernelError> {
    let header = Elf32Ehdr::parse(&kernel.fs, file)?;

    for phdr in header.phdrs(&kernel.fs, file)? {
        match phdr.p_type {
            PT_LOAD => {
                if !segment_valid(&phdr, file) {
                    return Err(KernelError::NoExec);
                }
                load_segment(process, file, &phdr)?;
            }
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(KernelError::NoExec),
            _ => {}
        }
    }

    let sp = setup_stack(process, args)?;
    Ok(LoadInfo {
        entry: header.e_entry as usize,
        sp,
    })
}

/// Checks that `phdr` describes a loadable segment of `file`.
fn segment_valid(phdr: &Elf32Phdr, file: &File) -> bool {
    // File offset and virtual address must agree on the page offset.
    if phdr.p_offset as usize & PAGE_MASK != phdr.p_vaddr as usize & PAGE_MASK {
        return false;
    }
    // The offset must point within the file.
    if phdr.p_offset as usize > file.size() {
        return false;
    }
    // The memory image must cover the file image and must not be empty.
    if phdr.p_memsz < phdr.p_filesz || phdr.p_memsz == 0 {
        return false;
    }
    // The region must lie inside user space and must not wrap.
    let end = phdr.p_vaddr as u64 + phdr.p_memsz as u64;
    if (phdr.p_vaddr as usize) < PAGE_SIZE || end >= USER_CEILING as u64 {
        return false;
    }
    true
}

/// Registers the pages of one loadable segment.
///
/// `read_bytes` bytes come from the file starting at the segment's page
/// base; the remainder up to the page-rounded memory size is zeroed. No
/// frame is touched here; each page materializes on its first fault.
fn load_segment(process: &Process, file: &Arc<File>, phdr: &Elf32Phdr) -> Result<(), KernelError> {
    let page_ofs = phdr.p_vaddr as usize & PAGE_MASK;
    let mut upage = phdr.p_vaddr as usize & !PAGE_MASK;
    let mut file_ofs = phdr.p_offset as usize & !PAGE_MASK;
    let writable = phdr.flags().contains(PFlags::WRITE);

    let (mut read_bytes, mut zero_bytes) = if phdr.p_filesz > 0 {
        let read = page_ofs + phdr.p_filesz as usize;
        let total = (page_ofs + phdr.p_memsz as usize).next_multiple_of(PAGE_SIZE);
        (read, total - read)
    } else {
        (0, (page_ofs + phdr.p_memsz as usize).next_multiple_of(PAGE_SIZE))
    };

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = read_bytes.min(PAGE_SIZE);
        let page_zero = PAGE_SIZE - page_read;

        process.pt.set_file(
            Va(upage),
            file.clone(),
            file_ofs,
            page_read,
            page_zero,
            writable,
            false,
        )?;

        read_bytes -= page_read;
        zero_bytes -= page_zero;
        upage += PAGE_SIZE;
        file_ofs += PAGE_SIZE;
    }
    Ok(())
}

/// Creates the stack page and marshals `args` onto it.
fn setup_stack(process: &mut Process, args: &[&str]) -> Result<usize, KernelError> {
    let stack_page = Va(USER_CEILING - PAGE_SIZE);
    process.pt.set_zero(stack_page)?;

    match push_args(process, args) {
        Ok(sp) => Ok(sp),
        Err(e) => {
            let kernel = process.kernel.clone();
            if let Some(kpage) = process.pt.clear_page(&kernel.frames, &kernel.swap, stack_page) {
                kernel.pool.free_page(kpage);
            }
            Err(e)
        }
    }
}

fn push_args(process: &Process, args: &[&str]) -> Result<usize, KernelError> {
    let mut builder = StackBuilder::new(process);

    // Argument strings, last one first, so argv[0] ends up lowest.
    let mut ptrs = Vec::with_capacity(args.len());
    for arg in args.iter().rev() {
        ptrs.push(builder.push_str(arg)? as u32);
    }

    builder.align(size_of::<u32>());

    // argv[argc] is null, then the pointers in descending index order.
    builder.push_u32(0)?;
    for ptr in &ptrs {
        builder.push_u32(*ptr)?;
    }

    let argv = builder.sp() as u32;
    builder.push_u32(argv)?;
    builder.push_u32(args.len() as u32)?;
    // Fake return address.
    builder.push_u32(0)?;
    Ok(builder.sp())
}

//! # Mica: a teaching operating system's storage and memory substrate.
//!
//! Mica is a small instructional operating system core. It covers the parts
//! of an OS that translate between a process's virtual address space, a file
//! system on a block device, and a scratch swap device. The surrounding
//! machine layer (interrupt plumbing, ring transitions, hardware paging) is
//! deliberately absent: this crate supplies the substrate those subsystems
//! are written against, backed by the host so that every layer above it can
//! be exercised with ordinary tests.
//!
//! The substrate consists of:
//!
//! - [`KernelError`], the error vocabulary shared by every subsystem.
//! - [`sync`], blocking mutexes, condition variables and counting
//!   semaphores.
//! - [`thread`], named kernel-thread spawning, sleeping and yielding.
//! - [`dev`], fixed 512-byte-sector block devices and the [`dev::Disk`]
//!   handle used for all disk I/O.
//! - [`mm`], user-frame allocation ([`mm::UserPool`]) and the simulated
//!   hardware page directory ([`mm::PageDirectory`]) with present, dirty and
//!   accessed bits.
//! - [`teletype`], the console byte sink behind file descriptors 0 and 1.
//!
//! Higher layers live in their own crates: `mica-fs` (free-sector map,
//! buffer cache, inode store), `mica-vm` (swap table, frame table,
//! supplemental page table) and `mica-user` (processes, the ELF loader and
//! system calls).

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

/// Asserts a condition at compile time.
///
/// Used to pin down the size of on-disk structures.
#[macro_export]
macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}

pub mod dev;
pub mod mm;
pub mod sync;
pub mod teletype;
pub mod thread;

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might occur
/// while serving a kernel operation. These errors can be returned to a user
/// program to indicate the nature of the failure.
#[derive(Debug, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// Exec format error. (ENOEXEC)
    NoExec,
    /// Bad file descriptor. (EBADF)
    BadFileDescriptor,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// File exists. (EEXIST)
    FileExist,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// Too many open files. (EMFILE)
    TooManyOpenFile,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// File name too long. (ENAMETOOLONG)
    NameTooLong,
    /// Invalid system call number. (ENOSYS)
    NoSuchSyscall,
    /// File system is corrupted. (EFSCORRUPTED)
    FilesystemCorrupted(&'static str),
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] into a corresponding `isize` error code,
    /// for use as a return value of a system call.
    pub fn into_isize(self) -> isize {
        match self {
            KernelError::OperationNotPermitted => -1,
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::NoExec => -8,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::FileExist => -17,
            KernelError::InvalidArgument => -22,
            KernelError::TooManyOpenFile => -24,
            KernelError::NoSpace => -28,
            KernelError::NameTooLong => -36,
            KernelError::NoSuchSyscall => -38,
            KernelError::FilesystemCorrupted(_) => -117,
            KernelError::NotSupportedOperation => -524,
        }
    }
}

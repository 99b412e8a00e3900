//! Mica's process layer: where user programs meet the storage core.
//!
//! Everything above the file system and the virtual-memory machinery
//! lives here:
//!
//! - [`system`]: boot-time assembly of the singletons shared by every
//!   process.
//! - [`process`]: the per-process state (descriptor table, mmap regions,
//!   child records) and the exec/wait/exit lifecycle.
//! - [`loader`]: the ELF32 loader and the argument-stack builder.
//! - [`syscall`]: the dispatch table tying syscall numbers to handlers.
//! - [`uaccess`]: probed access to user memory, the only way a handler
//!   may touch a user pointer.
pub mod loader;
pub mod process;
pub mod syscall;
pub mod system;
pub mod uaccess;

pub use process::Process;
pub use syscall::{SyscallAbi, SyscallNumber};
pub use system::{Kernel, SystemBuilder};

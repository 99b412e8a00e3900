//! System-call dispatch.
//!
//! The dispatcher decodes a [`SyscallAbi`], a raw system-call number with
//! its arguments, and routes it to the owning subsystem. All failures
//! come back as return values; the single exception is a bad user
//! pointer, which forces the process to exit with code -1.
use crate::process::Process;
use crate::uaccess::{UserCString, UserU8SliceRO, UserU8SliceWO};
use mica::KernelError;
use num_enum::TryFromPrimitive;

/// System-call numbers, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(usize)]
pub enum SyscallNumber {
    /// Terminate the whole system.
    Halt = 0,
    /// Terminate the calling process.
    Exit,
    /// Spawn a process from an executable.
    Exec,
    /// Wait for a child to exit.
    Wait,
    /// Create a file.
    Create,
    /// Remove a file.
    Remove,
    /// Open a file.
    Open,
    /// Size of an open file.
    Filesize,
    /// Read from an fd.
    Read,
    /// Write to an fd.
    Write,
    /// Move an fd's position.
    Seek,
    /// Report an fd's position.
    Tell,
    /// Close an fd.
    Close,
    /// Map a file into memory.
    Mmap,
    /// Unmap a mapping.
    Munmap,
}

/// A decoded system-call request.
///
/// The storage core uses at most three arguments; the remaining registers
/// of the machine ABI are ignored by every handler.
pub struct SyscallAbi {
    /// The system-call number.
    pub sysno: usize,
    /// First argument.
    pub arg1: usize,
    /// Second argument.
    pub arg2: usize,
    /// Third argument.
    pub arg3: usize,
}

impl SyscallAbi {
    /// Builds an ABI record from raw register values.
    pub fn new(sysno: usize, arg1: usize, arg2: usize, arg3: usize) -> Self {
        Self {
            sysno,
            arg1,
            arg2,
            arg3,
        }
    }
}

impl Process {
    /// Serves one system call, returning the value for the user's result
    /// register.
    pub fn syscall(&mut self, abi: &SyscallAbi) -> isize {
        let Ok(sysno) = SyscallNumber::try_from(abi.sysno) else {
            self.exit(-1);
            return -1;
        };
        match self.dispatch(sysno, abi) {
            Ok(value) => value,
            Err(KernelError::BadAddress) => {
                // An invalid pointer in any argument kills the process.
                self.exit(-1);
                -1
            }
            Err(_) => -1,
        }
    }

    fn dispatch(&mut self, sysno: SyscallNumber, abi: &SyscallAbi) -> Result<isize, KernelError> {
        match sysno {
            SyscallNumber::Halt => {
                self.kernel.shutdown();
                self.terminate(0, false);
                Ok(0)
            }
            SyscallNumber::Exit => {
                let code = abi.arg1 as i32;
                self.exit(code);
                Ok(code as isize)
            }
            SyscallNumber::Exec => {
                let cmdline = UserCString::new(abi.arg1).read(self)?;
                Ok(self.exec(&cmdline) as isize)
            }
            SyscallNumber::Wait => Ok(self.wait(abi.arg1 as i32) as isize),
            SyscallNumber::Create => {
                let name = UserCString::new(abi.arg1).read(self)?;
                Ok(self.kernel.fs.create(&name, abi.arg2).is_ok() as isize)
            }
            SyscallNumber::Remove => {
                let name = UserCString::new(abi.arg1).read(self)?;
                Ok(self.kernel.fs.remove(&name).is_ok() as isize)
            }
            SyscallNumber::Open => {
                let name = UserCString::new(abi.arg1).read(self)?;
                match self.kernel.fs.open(&name) {
                    Ok(file) => Ok(self.install_file(file) as isize),
                    Err(_) => Ok(-1),
                }
            }
            SyscallNumber::Filesize => Ok(self
                .file(abi.arg1 as i32)
                .map(|file| file.size() as isize)
                .unwrap_or(-1)),
            SyscallNumber::Read => self.sys_read(abi.arg1 as i32, abi.arg2, abi.arg3),
            SyscallNumber::Write => self.sys_write(abi.arg1 as i32, abi.arg2, abi.arg3),
            SyscallNumber::Seek => {
                let file = self
                    .file_mut(abi.arg1 as i32)
                    .ok_or(KernelError::BadFileDescriptor)?;
                file.seek(abi.arg2);
                Ok(0)
            }
            SyscallNumber::Tell => Ok(self
                .file(abi.arg1 as i32)
                .map(|file| file.tell() as isize)
                .unwrap_or(-1)),
            SyscallNumber::Close => {
                let kernel = self.kernel.clone();
                match self.take_file(abi.arg1 as i32) {
                    Some(file) => {
                        file.close(&kernel.fs);
                        Ok(0)
                    }
                    None => Ok(-1),
                }
            }
            SyscallNumber::Mmap => match self.mmap(abi.arg1 as i32, abi.arg2) {
                Ok(id) => Ok(id as isize),
                Err(_) => Ok(-1),
            },
            SyscallNumber::Munmap => Ok(match self.munmap(abi.arg1 as i32) {
                Ok(()) => 0,
                Err(_) => -1,
            }),
        }
    }

    fn sys_read(&mut self, fd: i32, addr: usize, len: usize) -> Result<isize, KernelError> {
        match fd {
            0 => {
                let mut bytes = vec![0u8; len];
                let n = self.kernel.console.read(&mut bytes);
                UserU8SliceWO::new(addr, len).put(self, &bytes[..n])?;
                Ok(n as isize)
            }
            1 => Ok(-1),
            fd => {
                let kernel = self.kernel.clone();
                let mut bytes = vec![0u8; len];
                let file = self.file_mut(fd).ok_or(KernelError::BadFileDescriptor)?;
                let n = file.read(&kernel.fs, &mut bytes);
                UserU8SliceWO::new(addr, len).put(self, &bytes[..n])?;
                Ok(n as isize)
            }
        }
    }

    fn sys_write(&mut self, fd: i32, addr: usize, len: usize) -> Result<isize, KernelError> {
        let bytes = UserU8SliceRO::new(addr, len).get(self)?;
        match fd {
            0 => Ok(-1),
            1 => {
                self.kernel.console.write(&bytes);
                Ok(bytes.len() as isize)
            }
            fd => {
                let kernel = self.kernel.clone();
                let file = self.file_mut(fd).ok_or(KernelError::BadFileDescriptor)?;
                Ok(file.write(&kernel.fs, &bytes) as isize)
            }
        }
    }
}

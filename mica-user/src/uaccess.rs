//! Probed user-memory access.
//!
//! The kernel must never trust a user-supplied address. Every system call
//! argument that names user memory is accessed through the types here,
//! which probe each touched page before the transfer: the page must lie
//! below the user ceiling and be mapped (demand-faulting it in if its
//! supplemental entry exists), and a store additionally requires a
//! writable mapping. A probe that fails surfaces as
//! [`KernelError::BadAddress`], which the system-call layer turns into a
//! forced exit with code -1.
//!
//! - [`UserPtrRO`] / [`UserPtrWO`]: a one-time pointer to a `Copy` value.
//! - [`UserU8SliceRO`] / [`UserU8SliceWO`]: byte buffers.
//! - [`UserCString`]: a NUL-terminated string.
use crate::process::Process;
use mica::KernelError;
use mica::mm::{PAGE_SIZE, PageRef, Va};

/// Translates `va` into its backing frame, faulting the page in if
/// needed.
///
/// Returns the frame and the offset of `va` within it. The access is
/// latched into the hardware accessed/dirty bits, as the MMU would on a
/// real load or store.
fn translate(process: &Process, va: Va, write: bool) -> Result<(mica::mm::Kva, usize), KernelError> {
    if !va.is_user() {
        return Err(KernelError::BadAddress);
    }
    let page = va.page_base();
    loop {
        if let Some(kpage) = process.pagedir.get_page(page) {
            if write && !process.pagedir.is_writable(page) {
                return Err(KernelError::BadAddress);
            }
            process.pagedir.mark_access(page, write);
            return Ok((kpage, va.page_ofs()));
        }
        process
            .handle_page_fault(page)
            .map_err(|_| KernelError::BadAddress)?;
    }
}

/// Copies `buf.len()` bytes from user address `addr` into `buf`.
pub(crate) fn copy_from_user(
    process: &Process,
    addr: usize,
    buf: &mut [u8],
) -> Result<(), KernelError> {
    let mut done = 0;
    while done < buf.len() {
        let (kpage, ofs) = translate(process, Va(addr + done), false)?;
        let chunk = (PAGE_SIZE - ofs).min(buf.len() - done);
        let page = unsafe { PageRef::from_kva(kpage) };
        buf[done..done + chunk].copy_from_slice(&page.inner()[ofs..ofs + chunk]);
        done += chunk;
    }
    Ok(())
}

/// Copies `bytes` to user address `addr`.
pub(crate) fn copy_to_user(
    process: &Process,
    addr: usize,
    bytes: &[u8],
) -> Result<(), KernelError> {
    let mut done = 0;
    while done < bytes.len() {
        let (kpage, ofs) = translate(process, Va(addr + done), true)?;
        let chunk = (PAGE_SIZE - ofs).min(bytes.len() - done);
        let mut page = unsafe { PageRef::from_kva(kpage) };
        page.inner_mut()[ofs..ofs + chunk].copy_from_slice(&bytes[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

/// A one-time, read-only pointer to a user-space value of type `T`.
pub struct UserPtrRO<T: Copy> {
    addr: usize,
    _ty: core::marker::PhantomData<T>,
}

impl<T: Copy> UserPtrRO<T> {
    /// Creates a pointer to user address `addr`.
    pub fn new(addr: usize) -> Self {
        Self {
            addr,
            _ty: core::marker::PhantomData,
        }
    }

    /// Reads the value, consuming the pointer.
    pub fn get(self, process: &Process) -> Result<T, KernelError> {
        let mut bytes = vec![0u8; size_of::<T>()];
        copy_from_user(process, self.addr, &mut bytes)?;
        Ok(unsafe { (bytes.as_ptr() as *const T).read_unaligned() })
    }
}

/// A one-time, write-only pointer to a user-space value of type `T`.
pub struct UserPtrWO<T: Copy> {
    addr: usize,
    _ty: core::marker::PhantomData<T>,
}

impl<T: Copy> UserPtrWO<T> {
    /// Creates a pointer to user address `addr`.
    pub fn new(addr: usize) -> Self {
        Self {
            addr,
            _ty: core::marker::PhantomData,
        }
    }

    /// Writes `value`, consuming the pointer.
    pub fn put(self, process: &Process, value: T) -> Result<usize, KernelError> {
        let bytes = unsafe {
            core::slice::from_raw_parts(&value as *const T as *const u8, size_of::<T>())
        };
        copy_to_user(process, self.addr, bytes)?;
        Ok(size_of::<T>())
    }
}

/// A one-time, read-only user-space byte buffer.
pub struct UserU8SliceRO {
    addr: usize,
    len: usize,
}

impl UserU8SliceRO {
    /// Creates a view of `len` bytes at user address `addr`.
    pub fn new(addr: usize, len: usize) -> Self {
        Self { addr, len }
    }

    /// Reads the buffer, consuming the view.
    pub fn get(self, process: &Process) -> Result<Vec<u8>, KernelError> {
        let mut bytes = vec![0u8; self.len];
        copy_from_user(process, self.addr, &mut bytes)?;
        Ok(bytes)
    }
}

/// A one-time, write-only user-space byte buffer.
pub struct UserU8SliceWO {
    addr: usize,
    len: usize,
}

impl UserU8SliceWO {
    /// Creates a view of `len` bytes at user address `addr`.
    pub fn new(addr: usize, len: usize) -> Self {
        Self { addr, len }
    }

    /// Writes up to `len` bytes from `other`, consuming the view.
    pub fn put(self, process: &Process, other: &[u8]) -> Result<usize, KernelError> {
        let size = self.len.min(other.len());
        copy_to_user(process, self.addr, &other[..size])?;
        Ok(size)
    }
}

/// A pointer to a NUL-terminated string in user space.
pub struct UserCString {
    addr: usize,
}

impl UserCString {
    /// Creates a pointer to user address `addr`.
    pub fn new(addr: usize) -> Self {
        Self { addr }
    }

    /// Reads the string, one probed byte at a time, until the NUL.
    pub fn read(self, process: &Process) -> Result<String, KernelError> {
        let mut bytes = Vec::new();
        let mut addr = self.addr;
        loop {
            let mut byte = [0u8];
            copy_from_user(process, addr, &mut byte)?;
            if byte[0] == 0 {
                return String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument);
            }
            bytes.push(byte[0]);
            addr += 1;
        }
    }
}

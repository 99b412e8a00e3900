//! ELF32 executable parsing.
//!
//! Mica loads statically linked ELF32 executables for the i386
//! architecture. Only the pieces the loader needs are modeled: the file
//! header, the program headers, and the segment permission flags.
use mica::KernelError;
use mica::const_assert;
use mica_fs::{Fs, file::File};

/// Loadable segment.
pub const PT_LOAD: u32 = 1;
/// Dynamic linking info; rejected.
pub const PT_DYNAMIC: u32 = 2;
/// Interpreter path; rejected.
pub const PT_INTERP: u32 = 3;
/// Reserved; rejected.
pub const PT_SHLIB: u32 = 5;

/// The ELF32 file header.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Elf32Ehdr {
    /// Identification bytes: magic, class, endianness, version.
    pub e_ident: [u8; 16],
    /// Object file type; 2 is an executable.
    pub e_type: u16,
    /// Target architecture; 3 is i386.
    pub e_machine: u16,
    /// ELF version (always 1).
    pub e_version: u32,
    /// Entry point virtual address.
    pub e_entry: u32,
    /// File offset of the program header table.
    pub e_phoff: u32,
    /// File offset of the section header table.
    pub e_shoff: u32,
    /// Processor-specific flags.
    pub e_flags: u32,
    /// Size of this header.
    pub e_ehsize: u16,
    /// Size of one program header entry.
    pub e_phentsize: u16,
    /// Number of program header entries.
    pub e_phnum: u16,
    /// Size of one section header entry.
    pub e_shentsize: u16,
    /// Number of section header entries.
    pub e_shnum: u16,
    /// Index of the section-name section.
    pub e_shstrndx: u16,
}
const_assert!(size_of::<Elf32Ehdr>() == 52);

impl Elf32Ehdr {
    /// Reads and validates the executable header of `file`.
    ///
    /// Accepts little-endian 32-bit i386 executables with a sane program
    /// header table (entries of the architectural size, at most 1024 of
    /// them); everything else is [`KernelError::NoExec`].
    pub fn parse(fs: &Fs, file: &File) -> Result<Self, KernelError> {
        let mut bytes = [0u8; size_of::<Elf32Ehdr>()];
        if file.read_at(fs, &mut bytes, 0) != bytes.len() {
            return Err(KernelError::NoExec);
        }
        let header = unsafe { (bytes.as_ptr() as *const Elf32Ehdr).read_unaligned() };

        if &header.e_ident[..7] == b"\x7fELF\x01\x01\x01"
            && /* Executable file. */ header.e_type == 2
            && /* i386. */ header.e_machine == 3
            && header.e_version == 1
            && header.e_phentsize as usize == size_of::<Elf32Phdr>()
            && header.e_phnum <= 1024
        {
            Ok(header)
        } else {
            Err(KernelError::NoExec)
        }
    }

    /// Reads the program header table of `file`.
    pub fn phdrs(&self, fs: &Fs, file: &File) -> Result<Vec<Elf32Phdr>, KernelError> {
        let mut buffer = vec![0u8; self.e_phnum as usize * size_of::<Elf32Phdr>()];
        if file.read_at(fs, &mut buffer, self.e_phoff as usize) != buffer.len() {
            return Err(KernelError::NoExec);
        }
        Ok(buffer
            .chunks_exact(size_of::<Elf32Phdr>())
            .map(|chunk| unsafe { (chunk.as_ptr() as *const Elf32Phdr).read_unaligned() })
            .collect())
    }
}

bitflags::bitflags! {
    /// Segment permission flags for ELF program headers.
    pub struct PFlags: u32 {
        /// Segment is executable.
        const EXECUTABLE = 1 << 0;
        /// Segment is writable.
        const WRITE = 1 << 1;
        /// Segment is readable.
        const READ = 1 << 2;
    }
}

/// An ELF32 program header.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct Elf32Phdr {
    /// Segment type.
    pub p_type: u32,
    /// Offset in the file where the segment starts.
    pub p_offset: u32,
    /// Virtual address where the segment should be mapped.
    pub p_vaddr: u32,
    /// Physical address (unused).
    pub p_paddr: u32,
    /// Size of the segment in the file.
    pub p_filesz: u32,
    /// Size of the segment in memory.
    pub p_memsz: u32,
    /// Permission flags.
    pub p_flags: u32,
    /// Alignment of the segment.
    pub p_align: u32,
}
const_assert!(size_of::<Elf32Phdr>() == 32);

impl Elf32Phdr {
    /// The segment's permission flags.
    pub fn flags(&self) -> PFlags {
        PFlags::from_bits_truncate(self.p_flags)
    }
}

//! ELF64 header validation and program-header extraction.
//!
//! Parses the fixed-size file header and the program-header table out of a
//! raw byte view, validates both, and produces the sequence of
//! [`SegmentDescriptor`]s the layout planner and segment mapper consume.
//! Section headers are deliberately not consumed: the loader only needs the
//! execution view of the binary.

use std::mem::size_of;

use crate::error::LoaderError;

/// ELF magic number: 0x7F 'E' 'L' 'F'
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// ELF class: 64-bit
pub const ELFCLASS64: u8 = 2;

/// ELF data encoding: little endian
pub const ELFDATA2LSB: u8 = 1;

/// ELF type: executable (fixed load addresses)
pub const ET_EXEC: u16 = 2;

/// ELF type: shared object (PIE, relative load addresses)
pub const ET_DYN: u16 = 3;

/// Machine type: x86_64
pub const EM_X86_64: u16 = 62;

/// Machine type: AArch64
pub const EM_AARCH64: u16 = 183;

/// Machine type accepted on this host.
#[cfg(target_arch = "x86_64")]
pub const EM_HOST: u16 = EM_X86_64;

/// Machine type accepted on this host.
#[cfg(target_arch = "aarch64")]
pub const EM_HOST: u16 = EM_AARCH64;

/// Program header type: loadable segment
pub const PT_LOAD: u32 = 1;

/// Program header type: dynamic linking info
pub const PT_DYNAMIC: u32 = 2;

/// Program header type: interpreter path
pub const PT_INTERP: u32 = 3;

/// Program header type: program header table
pub const PT_PHDR: u32 = 6;

/// Segment permission: executable
pub const PF_X: u32 = 1;

/// Segment permission: writable
pub const PF_W: u32 = 2;

/// Segment permission: readable
pub const PF_R: u32 = 4;

/// ELF64 file header
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Elf64Header {
    /// Magic number and other info
    pub e_ident: [u8; 16],
    /// Object file type
    pub e_type: u16,
    /// Machine type
    pub e_machine: u16,
    /// Object file version
    pub e_version: u32,
    /// Entry point virtual address
    pub e_entry: u64,
    /// Program header table file offset
    pub e_phoff: u64,
    /// Section header table file offset
    pub e_shoff: u64,
    /// Processor-specific flags
    pub e_flags: u32,
    /// ELF header size
    pub e_ehsize: u16,
    /// Program header table entry size
    pub e_phentsize: u16,
    /// Program header table entry count
    pub e_phnum: u16,
    /// Section header table entry size
    pub e_shentsize: u16,
    /// Section header table entry count
    pub e_shnum: u16,
    /// Section name string table index
    pub e_shstrndx: u16,
}

/// ELF64 program header
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Elf64ProgramHeader {
    /// Segment type
    pub p_type: u32,
    /// Segment flags
    pub p_flags: u32,
    /// Segment file offset
    pub p_offset: u64,
    /// Segment virtual address
    pub p_vaddr: u64,
    /// Segment physical address (unused)
    pub p_paddr: u64,
    /// Segment size in file
    pub p_filesz: u64,
    /// Segment size in memory
    pub p_memsz: u64,
    /// Segment alignment
    pub p_align: u64,
}

/// One LOAD entry of the program-header table, in encounter order.
///
/// `index` is the entry's position in the full table, kept so error
/// messages can point back at the offending program header.
#[derive(Debug, Clone)]
pub struct SegmentDescriptor {
    /// Index in the program-header table
    pub index: usize,
    /// Virtual address where the segment wants to live
    pub vaddr: u64,
    /// Size of the segment in memory
    pub memsz: u64,
    /// File offset of the segment data
    pub offset: u64,
    /// Size of the segment data in the file
    pub filesz: u64,
    /// Permission flags (PF_R, PF_W, PF_X)
    pub flags: u32,
    /// Alignment requirement
    pub align: u64,
}

impl SegmentDescriptor {
    /// Check if the segment is readable
    pub fn is_readable(&self) -> bool {
        self.flags & PF_R != 0
    }

    /// Check if the segment is writable
    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }

    /// Check if the segment is executable
    pub fn is_executable(&self) -> bool {
        self.flags & PF_X != 0
    }
}

/// Validated execution view of an ELF64 binary.
#[derive(Debug)]
pub struct ElfObject {
    /// Entry point virtual address (unbiased)
    pub entry: u64,
    /// True for ET_DYN: all virtual addresses are base-relative
    pub is_pie: bool,
    /// Virtual address of the program-header table (from PT_PHDR), if any
    pub phdr_vaddr: Option<u64>,
    /// Program header table file offset
    pub phoff: u64,
    /// Program header entry size
    pub phentsize: u16,
    /// Program header entry count
    pub phnum: u16,
    /// LOAD segments, sorted by virtual address
    pub load_segments: Vec<SegmentDescriptor>,
    /// Interpreter path from PT_INTERP, if present
    pub interpreter: Option<String>,
}

/// Parse and validate an ELF64 binary from its raw bytes.
///
/// Fails with [`LoaderError::MalformedHeader`] on anything that makes the
/// file unusable as an ELF64 executable, and with
/// [`LoaderError::UnsupportedMachine`] when the target architecture does
/// not match the host. No side effects beyond reading.
pub fn parse(bytes: &[u8]) -> Result<ElfObject, LoaderError> {
    let header = read_header(bytes)?;
    validate_header(&header)?;

    let table = read_program_headers(bytes, &header)?;
    let load_segments = collect_load_segments(bytes, &table)?;
    if load_segments.is_empty() {
        return Err(malformed("no loadable segments"));
    }

    let interpreter = find_interpreter(bytes, &table)?;
    let phdr_vaddr = table
        .iter()
        .find(|ph| ph.p_type == PT_PHDR)
        .map(|ph| ph.p_vaddr);

    Ok(ElfObject {
        entry: header.e_entry,
        is_pie: header.e_type == ET_DYN,
        phdr_vaddr,
        phoff: header.e_phoff,
        phentsize: header.e_phentsize,
        phnum: header.e_phnum,
        load_segments,
        interpreter,
    })
}

fn malformed(reason: impl Into<String>) -> LoaderError {
    LoaderError::MalformedHeader {
        reason: reason.into(),
    }
}

fn read_header(bytes: &[u8]) -> Result<Elf64Header, LoaderError> {
    if bytes.len() < size_of::<Elf64Header>() {
        return Err(malformed(format!(
            "file is {} bytes, shorter than the {}-byte ELF header",
            bytes.len(),
            size_of::<Elf64Header>()
        )));
    }
    // SAFETY: length checked above; Elf64Header is repr(C, packed) and
    // read_unaligned tolerates any source alignment.
    let header =
        unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Elf64Header) };
    Ok(header)
}

fn validate_header(header: &Elf64Header) -> Result<(), LoaderError> {
    if header.e_ident[0..4] != ELF_MAGIC {
        return Err(malformed("bad magic bytes"));
    }
    if header.e_ident[4] != ELFCLASS64 {
        return Err(malformed("not a 64-bit binary"));
    }
    if header.e_ident[5] != ELFDATA2LSB {
        return Err(malformed("not little-endian"));
    }
    if header.e_ident[6] != 1 {
        return Err(malformed("bad ELF version"));
    }
    if header.e_type != ET_EXEC && header.e_type != ET_DYN {
        let ty = header.e_type;
        return Err(malformed(format!(
            "type {ty:#x} is neither ET_EXEC nor ET_DYN"
        )));
    }
    if header.e_machine != EM_HOST {
        return Err(LoaderError::UnsupportedMachine {
            machine: header.e_machine,
            expected: EM_HOST,
        });
    }
    if header.e_phentsize as usize != size_of::<Elf64ProgramHeader>() {
        let sz = header.e_phentsize;
        return Err(malformed(format!("program header entry size {sz}")));
    }
    Ok(())
}

/// Read the whole program-header table, bounds-checked against the file.
fn read_program_headers(
    bytes: &[u8],
    header: &Elf64Header,
) -> Result<Vec<Elf64ProgramHeader>, LoaderError> {
    let phoff = usize::try_from(header.e_phoff)
        .map_err(|_| malformed("program header offset overflows"))?;
    let phentsize = header.e_phentsize as usize;
    let phnum = header.e_phnum as usize;

    let table_len = phnum
        .checked_mul(phentsize)
        .ok_or_else(|| malformed("program header table size overflows"))?;
    let table_end = phoff
        .checked_add(table_len)
        .ok_or_else(|| malformed("program header table end overflows"))?;
    if table_end > bytes.len() {
        return Err(malformed(format!(
            "program header table [{phoff:#x}, {table_end:#x}) extends past \
             end of file ({:#x} bytes)",
            bytes.len()
        )));
    }

    let mut table = Vec::with_capacity(phnum);
    for i in 0..phnum {
        // SAFETY: [phoff, table_end) is inside `bytes` per the check above.
        let ph = unsafe {
            std::ptr::read_unaligned(
                bytes.as_ptr().add(phoff + i * phentsize) as *const Elf64ProgramHeader
            )
        };
        table.push(ph);
    }
    Ok(table)
}

/// Extract LOAD entries (index 0 included), validate each against the file
/// length, and sort them by virtual address.
fn collect_load_segments(
    bytes: &[u8],
    table: &[Elf64ProgramHeader],
) -> Result<Vec<SegmentDescriptor>, LoaderError> {
    let mut segments = Vec::new();

    for (index, ph) in table.iter().enumerate() {
        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.p_memsz < ph.p_filesz {
            let (memsz, filesz) = (ph.p_memsz, ph.p_filesz);
            return Err(malformed(format!(
                "segment {index}: memsz {memsz:#x} < filesz {filesz:#x}"
            )));
        }
        if ph.p_vaddr.checked_add(ph.p_memsz).is_none() {
            return Err(malformed(format!("segment {index}: vaddr + memsz overflows")));
        }
        let file_end = ph
            .p_offset
            .checked_add(ph.p_filesz)
            .ok_or_else(|| malformed(format!("segment {index}: offset + filesz overflows")))?;
        if file_end > bytes.len() as u64 {
            let (offset, filesz) = (ph.p_offset, ph.p_filesz);
            return Err(malformed(format!(
                "segment {index}: file range [{offset:#x}, {:#x}) extends past \
                 end of file, filesz {filesz:#x}",
                file_end
            )));
        }
        if ph.p_align > 1 && !ph.p_align.is_power_of_two() {
            let align = ph.p_align;
            return Err(malformed(format!(
                "segment {index}: alignment {align:#x} is not a power of two"
            )));
        }

        segments.push(SegmentDescriptor {
            index,
            vaddr: ph.p_vaddr,
            memsz: ph.p_memsz,
            offset: ph.p_offset,
            filesz: ph.p_filesz,
            flags: ph.p_flags,
            align: ph.p_align,
        });
    }

    segments.sort_by_key(|s| s.vaddr);
    Ok(segments)
}

/// Read the NUL-terminated interpreter path from PT_INTERP, if present.
fn find_interpreter(
    bytes: &[u8],
    table: &[Elf64ProgramHeader],
) -> Result<Option<String>, LoaderError> {
    let Some(ph) = table.iter().find(|ph| ph.p_type == PT_INTERP) else {
        return Ok(None);
    };

    let offset = usize::try_from(ph.p_offset)
        .map_err(|_| malformed("interpreter offset overflows"))?;
    let size = usize::try_from(ph.p_filesz)
        .map_err(|_| malformed("interpreter size overflows"))?;
    let end = offset
        .checked_add(size)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| malformed("interpreter path extends past end of file"))?;

    let path_bytes = &bytes[offset..end];
    let path_len = path_bytes.iter().position(|&b| b == 0).unwrap_or(size);
    if path_len == 0 {
        return Err(malformed("empty interpreter path"));
    }
    let path = std::str::from_utf8(&path_bytes[..path_len])
        .map_err(|_| malformed("interpreter path is not UTF-8"))?;
    Ok(Some(path.to_owned()))
}

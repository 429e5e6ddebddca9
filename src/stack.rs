//! Initial process stack construction.
//!
//! Builds the argc/argv/envp/auxv block the platform startup ABI expects
//! at the new program's stack pointer. The image is assembled in one
//! contiguous buffer whose end sits at the top of the new stack; the
//! buffer's first byte is the final stack pointer, which is always
//! 16-byte aligned.
//!
//! # Stack layout (x86-64 SysV)
//!
//! ```text
//!   (high address = stack top)
//!   +-------------------+
//!   | 16 random bytes   | ← AT_RANDOM points here
//!   | string data       | ← env strings, then arg strings
//!   +-------------------+
//!   | padding (align 16)|
//!   +-------------------+
//!   | AT_NULL (0, 0)    |
//!   | auxv[n] ...       |
//!   +-------------------+
//!   | NULL              | ← end of envp
//!   | envp pointers     |
//!   +-------------------+
//!   | NULL              | ← end of argv
//!   | argv pointers     |
//!   +-------------------+
//!   | argc              | ← SP points here
//!   +-------------------+
//!   (low address)
//! ```

use crate::error::LoaderError;

/// Auxiliary vector entry types.
pub mod auxv {
    /// End of auxiliary vector
    pub const AT_NULL: u64 = 0;
    /// Program headers location
    pub const AT_PHDR: u64 = 3;
    /// Size of a program header entry
    pub const AT_PHENT: u64 = 4;
    /// Number of program headers
    pub const AT_PHNUM: u64 = 5;
    /// Page size
    pub const AT_PAGESZ: u64 = 6;
    /// Base address of the interpreter (0 when none)
    pub const AT_BASE: u64 = 7;
    /// Program entry point
    pub const AT_ENTRY: u64 = 9;
    /// Pointer to 16 random bytes (stack-protector seed)
    pub const AT_RANDOM: u64 = 25;
}

/// Computed values carried into the auxiliary vector.
#[derive(Debug, Clone, Copy)]
pub struct AuxValues {
    /// Biased entry point of the main program
    pub entry: u64,
    /// Runtime address of the program-header table
    pub phdr: u64,
    /// Size of one program-header entry
    pub phent: u64,
    /// Number of program-header entries
    pub phnum: u64,
    /// Page size
    pub pagesz: u64,
    /// Interpreter load bias, or 0 for a static binary
    pub base: u64,
}

const WORD: usize = std::mem::size_of::<u64>();

/// Fixed auxv entries emitted, including the AT_NULL terminator.
const AUXV_ENTRIES: usize = 8;

/// The finished stack image.
///
/// `buf` spans exactly `[sp, top)`: index 0 of the buffer is the argc cell
/// the final stack pointer addresses. Copy the buffer so its end lands on
/// `top`, point the stack register at `sp`, and the image is live;
/// ownership passes to the running program and the loader never mutates
/// it again.
#[derive(Debug)]
pub struct StackImage {
    buf: Vec<u8>,
    top: u64,
}

impl StackImage {
    /// Assemble the stack image for the given strings and computed values.
    ///
    /// `top` is the virtual address the buffer's end will occupy (must be
    /// 16-byte aligned); `limit` is the stack budget — exceeding it fails
    /// with [`LoaderError::StackOverflowBudget`].
    pub fn build(
        args: &[String],
        envs: &[String],
        aux: &AuxValues,
        random: &[u8; 16],
        top: u64,
        limit: usize,
    ) -> Result<StackImage, LoaderError> {
        debug_assert_eq!(top % 16, 0);

        // String table: environment strings first, then argument strings.
        let env_bytes: usize = envs.iter().map(|s| s.len() + 1).sum();
        let arg_bytes: usize = args.iter().map(|s| s.len() + 1).sum();

        let random_addr = top - 16;
        let strings_addr = random_addr - (env_bytes + arg_bytes) as u64;

        // Pointer area, built after the strings so alignment is exact:
        // argc, argv + NULL, envp + NULL, auxv pairs.
        let words = 1 + (args.len() + 1) + (envs.len() + 1) + AUXV_ENTRIES * 2;
        let vectors_end = strings_addr & !(WORD as u64 - 1);
        let unaligned_sp = vectors_end - (words * WORD) as u64;
        // Drop to the next 16-byte boundary so the entry contract holds.
        let sp = unaligned_sp & !0xF;

        let required = (top - sp) as usize;
        if required > limit {
            return Err(LoaderError::StackOverflowBudget { required, limit });
        }

        let mut image = StackImage {
            buf: vec![0u8; required],
            top,
        };

        // argc, then the argv pointer array.
        let mut cursor = sp;
        image.put_word(cursor, args.len() as u64);
        cursor += WORD as u64;

        let mut str_addr = strings_addr + env_bytes as u64;
        for arg in args {
            image.put_word(cursor, str_addr);
            cursor += WORD as u64;
            image.put_bytes(str_addr, arg.as_bytes());
            str_addr += arg.len() as u64 + 1; // NUL already zero
        }
        image.put_word(cursor, 0);
        cursor += WORD as u64;

        // envp pointer array.
        let mut str_addr = strings_addr;
        for env in envs {
            image.put_word(cursor, str_addr);
            cursor += WORD as u64;
            image.put_bytes(str_addr, env.as_bytes());
            str_addr += env.len() as u64 + 1;
        }
        image.put_word(cursor, 0);
        cursor += WORD as u64;

        // Auxiliary vector, AT_NULL last.
        let pairs = [
            (auxv::AT_PHDR, aux.phdr),
            (auxv::AT_PHENT, aux.phent),
            (auxv::AT_PHNUM, aux.phnum),
            (auxv::AT_PAGESZ, aux.pagesz),
            (auxv::AT_BASE, aux.base),
            (auxv::AT_ENTRY, aux.entry),
            (auxv::AT_RANDOM, random_addr),
            (auxv::AT_NULL, 0),
        ];
        debug_assert_eq!(pairs.len(), AUXV_ENTRIES);
        for (key, value) in pairs {
            image.put_word(cursor, key);
            image.put_word(cursor + WORD as u64, value);
            cursor += 2 * WORD as u64;
        }

        image.put_bytes(random_addr, random);

        log::debug!(
            "[stack] image {} bytes, sp {sp:#x}, {} args, {} envs",
            required,
            args.len(),
            envs.len()
        );
        Ok(image)
    }

    /// Final stack pointer (the address of the argc cell).
    pub fn sp(&self) -> u64 {
        self.top - self.buf.len() as u64
    }

    /// The image bytes, low address first.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Read the u64 cell at virtual address `addr` (inspection helper).
    ///
    /// # Panics
    ///
    /// Panics if `addr` is outside the image.
    pub fn word_at(&self, addr: u64) -> u64 {
        let off = (addr - self.sp()) as usize;
        u64::from_le_bytes(self.buf[off..off + WORD].try_into().unwrap())
    }

    /// Read `len` bytes at virtual address `addr` (inspection helper).
    pub fn bytes_at(&self, addr: u64, len: usize) -> &[u8] {
        let off = (addr - self.sp()) as usize;
        &self.buf[off..off + len]
    }

    fn put_word(&mut self, addr: u64, value: u64) {
        let off = (addr - self.sp()) as usize;
        self.buf[off..off + WORD].copy_from_slice(&value.to_le_bytes());
    }

    fn put_bytes(&mut self, addr: u64, bytes: &[u8]) {
        let off = (addr - self.sp()) as usize;
        self.buf[off..off + bytes.len()].copy_from_slice(bytes);
    }
}

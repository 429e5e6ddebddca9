//! Read-only memory-mapped view of the target file.
//!
//! The view is owned for the lifetime of the load operation and released
//! when dropped; file-backed segment mappings created from the same file
//! descriptor outlive it.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;

use crate::error::LoaderError;

/// The raw bytes of the target ELF file, mapped read-only.
pub struct ElfImage {
    file: File,
    addr: *mut libc::c_void,
    len: usize,
}

impl ElfImage {
    /// Open `path` and map its full contents read-only.
    pub fn open(path: &Path) -> Result<Self, LoaderError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Err(LoaderError::MalformedHeader {
                reason: "file is empty".into(),
            });
        }
        let len = usize::try_from(len).map_err(|_| LoaderError::MalformedHeader {
            reason: "file too large to map".into(),
        })?;

        // SAFETY: fresh private read-only mapping of a file we hold open.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(LoaderError::Io(std::io::Error::last_os_error()));
        }

        Ok(Self { file, addr, len })
    }

    /// The mapped file contents.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping covers exactly `len` readable bytes and lives
        // as long as `self`.
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }

    /// Raw file descriptor for file-backed segment mappings.
    pub fn raw_fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the mapping is empty (never the case after `open`).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ElfImage {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact region mapped in `open`.
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

//! Address-space layout planning.
//!
//! Scans the LOAD segments for the total virtual span, reserves one
//! contiguous permission-free region covering it, and derives the load
//! bias added to every segment's virtual address. Reserving the whole span
//! up front keeps inter-segment distances identical to the file layout no
//! matter where the kernel places the region, which is what makes
//! position-independent loading deterministic.

use std::ptr;

use crate::elf::SegmentDescriptor;
use crate::error::LoaderError;

/// Host page size.
pub fn page_size() -> u64 {
    // SAFETY: sysconf(_SC_PAGESIZE) has no side effects.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

/// Round `value` down to a page boundary. `page` must be a power of two.
pub fn page_floor(value: u64, page: u64) -> u64 {
    value & !(page - 1)
}

/// Round `value` up to a page boundary. `page` must be a power of two.
pub fn page_ceil(value: u64, page: u64) -> u64 {
    (value + page - 1) & !(page - 1)
}

/// The planned address layout for one load attempt.
///
/// Produced once per load and threaded explicitly into the segment mapper;
/// never reused across calls.
#[derive(Debug, Clone, Copy)]
pub struct AddressSpacePlan {
    /// Load bias: added to every segment vaddr to get its runtime address.
    /// Zero for fixed-address (ET_EXEC) binaries.
    pub base: u64,
    /// Lowest vaddr of any LOAD segment.
    pub min_vaddr: u64,
    /// Highest `vaddr + memsz` of any LOAD segment.
    pub max_end: u64,
    /// Start of the reserved region (page-aligned).
    pub reservation_start: u64,
    /// Length of the reserved region (whole pages).
    pub reservation_len: u64,
}

/// Drop guard for the reserved region.
///
/// Until [`Reservation::commit`] is called, dropping it unmaps the whole
/// region — including every segment mapping placed inside it — so a failed
/// load never leaves a partial address space behind.
#[derive(Debug)]
pub struct Reservation {
    start: u64,
    len: u64,
    committed: bool,
}

impl Reservation {
    /// Keep the region mapped; ownership passes to the process image.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            log::debug!(
                "[layout] releasing reservation [{:#x}, {:#x})",
                self.start,
                self.start + self.len
            );
            // SAFETY: we own [start, start+len); all segment mappings were
            // placed inside it with MAP_FIXED.
            unsafe {
                libc::munmap(self.start as *mut libc::c_void, self.len as usize);
            }
        }
    }
}

/// Virtual span of the LOAD segments: `(min_vaddr, max_end)`.
///
/// `min_vaddr` is seeded from the first segment rather than from zero, so
/// a LOAD at virtual address 0 (the common PIE case) is never discarded.
pub fn compute_span(segments: &[SegmentDescriptor]) -> Result<(u64, u64), LoaderError> {
    let first = segments.first().ok_or_else(|| LoaderError::MalformedHeader {
        reason: "no loadable segments".into(),
    })?;

    let mut min_vaddr = first.vaddr;
    let mut max_end = first.vaddr + first.memsz;
    for seg in &segments[1..] {
        min_vaddr = min_vaddr.min(seg.vaddr);
        max_end = max_end.max(seg.vaddr + seg.memsz);
    }
    Ok((min_vaddr, max_end))
}

/// Reserve one contiguous, permission-free region spanning all LOAD
/// segments and derive the load bias.
///
/// PIE binaries get a kernel-chosen region and a non-zero bias; ET_EXEC
/// binaries are reserved exactly at their fixed addresses with zero bias.
/// Fails with [`LoaderError::ReservationFailed`] when the region cannot be
/// obtained (address-space exhaustion, or a fixed range already occupied).
pub fn plan(
    segments: &[SegmentDescriptor],
    is_pie: bool,
    page: u64,
) -> Result<(AddressSpacePlan, Reservation), LoaderError> {
    let (min_vaddr, max_end) = compute_span(segments)?;

    let span_start = page_floor(min_vaddr, page);
    let span_end = page_ceil(max_end, page);
    let len = span_end - span_start;

    let (hint, flags) = if is_pie {
        (ptr::null_mut(), libc::MAP_PRIVATE | libc::MAP_ANONYMOUS)
    } else {
        (
            span_start as *mut libc::c_void,
            // No-replace keeps a fixed-address binary from clobbering the
            // loader's own mappings; an occupied range is a clean failure.
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
        )
    };

    // SAFETY: anonymous PROT_NONE reservation; never touches existing
    // mappings (no-replace for the fixed case).
    let addr = unsafe { libc::mmap(hint, len as usize, libc::PROT_NONE, flags, -1, 0) };
    if addr == libc::MAP_FAILED {
        return Err(LoaderError::ReservationFailed {
            len,
            source: std::io::Error::last_os_error(),
        });
    }
    let reservation_start = addr as u64;
    if !is_pie && reservation_start != span_start {
        // The kernel honored the hint loosely instead of exactly.
        unsafe {
            libc::munmap(addr, len as usize);
        }
        return Err(LoaderError::ReservationFailed {
            len,
            source: std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("wanted fixed region at {span_start:#x}, got {reservation_start:#x}"),
            ),
        });
    }

    let base = reservation_start - span_start;
    log::debug!(
        "[layout] reserved [{reservation_start:#x}, {:#x}), base {base:#x}",
        reservation_start + len
    );

    Ok((
        AddressSpacePlan {
            base,
            min_vaddr,
            max_end,
            reservation_start,
            reservation_len: len,
        },
        Reservation {
            start: reservation_start,
            len,
            committed: false,
        },
    ))
}

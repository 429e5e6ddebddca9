//! Segment mapping engine.
//!
//! Turns the planned address layout into live mappings: one file-backed,
//! copy-on-write mapping per LOAD segment (plus anonymous pages for BSS
//! tails), with permissions derived from the segment flags. Each segment
//! is first classified into a small closed set of mapping steps, and each
//! step kind is handled by one routine — the page-phase arithmetic happens
//! in exactly one place.
//!
//! After all segments are mapped, the distances between consecutive
//! segments in memory are cross-checked against their distances in the
//! file; a mismatch means the planner or mapper is defective and the load
//! is aborted rather than handed to a control transfer.

use std::ptr;

use crate::elf::SegmentDescriptor;
use crate::error::LoaderError;
use crate::image::ElfImage;
use crate::layout::{page_ceil, page_floor, AddressSpacePlan};

/// A live mapping produced for one LOAD segment.
///
/// The `(runtime_addr, file_offset)` pair is kept so the relative-offset
/// invariant can be asserted across consecutive segments.
#[derive(Debug, Clone)]
pub struct MappedSegment {
    /// Program-header index of the segment
    pub index: usize,
    /// Actual address of the segment's first byte (bias applied)
    pub runtime_addr: u64,
    /// File offset the segment was mapped from
    pub file_offset: u64,
    /// Bytes occupied in memory
    pub memsz: u64,
    /// mmap protection bits applied
    pub prot: i32,
}

/// One mapping decision for a segment, produced by [`plan_segment`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum MappingStep {
    /// Fresh pages: one private file-backed mapping at `map_addr`.
    NeedsFileMapping {
        map_addr: u64,
        map_len: u64,
        file_offset: u64,
    },
    /// The leading pages already belong to the previous segment's claim;
    /// the head bytes are copied out of the file image instead of
    /// remapped, so the earlier segment's pages stay intact.
    SharesPriorMapping {
        copy_addr: u64,
        file_start: u64,
        len: u64,
    },
    /// Zero pages past the last file-backed page, up to `memsz`.
    NeedsAnonymousTail { map_addr: u64, map_len: u64 },
}

/// Map every LOAD segment into the reserved region, in ascending virtual
/// address order, and verify the relative-offset invariant.
pub fn map_segments(
    image: &ElfImage,
    segments: &[SegmentDescriptor],
    plan: &AddressSpacePlan,
    page: u64,
) -> Result<Vec<MappedSegment>, LoaderError> {
    let mut mapped = Vec::with_capacity(segments.len());
    // First page not yet claimed by any earlier segment, and the
    // protection of the mapping holding the highest claim.
    let mut claimed_end = 0u64;
    let mut claim_prot = libc::PROT_NONE;

    for seg in segments {
        let page_phase = seg.offset % page;
        if page_phase != seg.vaddr % page {
            return Err(LoaderError::BadAlignment {
                index: seg.index,
                offset: seg.offset,
                vaddr: seg.vaddr,
            });
        }

        let prot = prot_flags(seg);
        let steps = plan_segment(seg, plan.base, page, claimed_end);
        log::debug!(
            "[segment] {}: vaddr {:#x} -> {:#x}, {} step(s)",
            seg.index,
            seg.vaddr,
            plan.base + seg.vaddr,
            steps.len()
        );

        for step in &steps {
            match *step {
                MappingStep::NeedsFileMapping {
                    map_addr,
                    map_len,
                    file_offset,
                } => map_file_pages(image, seg.index, map_addr, map_len, file_offset, prot)?,
                MappingStep::SharesPriorMapping {
                    copy_addr,
                    file_start,
                    len,
                } => copy_shared_head(image, copy_addr, file_start, len, page, claim_prot)?,
                MappingStep::NeedsAnonymousTail { map_addr, map_len } => {
                    map_anonymous_tail(seg.index, map_addr, map_len, prot)?
                }
            }
        }

        let (zero_start, zero_end) = zero_span(seg, plan.base, page, claimed_end);
        if zero_end > zero_start {
            // Pages below the claim boundary carry the claim owner's
            // protection, not this segment's.
            let owner_prot = if zero_start < claimed_end { claim_prot } else { prot };
            zero_range(zero_start, zero_end - zero_start, owner_prot, page)?;
        }

        let runtime_addr = plan.base + seg.vaddr;
        let seg_claim = page_ceil(runtime_addr + seg.memsz, page);
        if seg_claim > claimed_end {
            claimed_end = seg_claim;
            claim_prot = prot;
        }
        mapped.push(MappedSegment {
            index: seg.index,
            runtime_addr,
            file_offset: seg.offset,
            memsz: seg.memsz,
            prot,
        });
    }

    check_relative_offsets(&mapped)?;
    Ok(mapped)
}

/// Translate segment permission flags to mmap protection bits.
///
/// A segment with no flags at all maps with no access — valid for
/// alignment padding.
fn prot_flags(seg: &SegmentDescriptor) -> i32 {
    let mut prot = libc::PROT_NONE;
    if seg.is_readable() {
        prot |= libc::PROT_READ;
    }
    if seg.is_writable() {
        prot |= libc::PROT_WRITE;
    }
    if seg.is_executable() {
        prot |= libc::PROT_EXEC;
    }
    if seg.is_writable() && seg.is_executable() {
        log::warn!(
            "[segment] {}: W+X segment at {:#x}",
            seg.index,
            seg.vaddr
        );
    }
    prot
}

/// Classify one segment into its mapping steps.
///
/// `claimed_end` is the first page boundary not claimed by any earlier
/// segment (earlier claims run through the zero-fill region, so the
/// first writer wins on shared pages).
fn plan_segment(
    seg: &SegmentDescriptor,
    base: u64,
    page: u64,
    claimed_end: u64,
) -> Vec<MappingStep> {
    let runtime_start = base + seg.vaddr;
    let file_end = runtime_start + seg.filesz;
    let mem_end = runtime_start + seg.memsz;
    let first_page = page_floor(runtime_start, page);

    let mut steps = Vec::new();

    if seg.filesz > 0 {
        if first_page >= claimed_end {
            steps.push(MappingStep::NeedsFileMapping {
                map_addr: first_page,
                map_len: file_end - first_page,
                file_offset: page_floor(seg.offset, page),
            });
        } else {
            let shared_end = claimed_end.min(file_end);
            if runtime_start < shared_end {
                steps.push(MappingStep::SharesPriorMapping {
                    copy_addr: runtime_start,
                    file_start: seg.offset,
                    len: shared_end - runtime_start,
                });
            }
            if file_end > claimed_end {
                // claimed_end is page-aligned and shares the segment's
                // page phase, so the resumed file offset is page-aligned.
                steps.push(MappingStep::NeedsFileMapping {
                    map_addr: claimed_end,
                    map_len: file_end - claimed_end,
                    file_offset: seg.offset + (claimed_end - runtime_start),
                });
            }
        }
    }

    let anon_start = anon_tail_start(seg, base, page, claimed_end);
    let anon_end = page_ceil(mem_end, page);
    if anon_end > anon_start {
        steps.push(MappingStep::NeedsAnonymousTail {
            map_addr: anon_start,
            map_len: anon_end - anon_start,
        });
    }

    steps
}

/// First address covered by the segment's fresh anonymous pages.
///
/// Never below the claim boundary: remapping a claimed page anonymously
/// would wipe the earlier segment's bytes.
fn anon_tail_start(seg: &SegmentDescriptor, base: u64, page: u64, claimed_end: u64) -> u64 {
    let runtime_start = base + seg.vaddr;
    let own_start = if seg.filesz > 0 {
        page_ceil(runtime_start + seg.filesz, page)
    } else {
        page_floor(runtime_start, page)
    };
    own_start.max(claimed_end)
}

/// Byte range the mapper must zero by hand.
///
/// Fresh anonymous tail pages arrive zeroed from the kernel; everything
/// between `filesz` and the first tail page still carries file bytes —
/// either the segment's own trailing page or the head of a page an
/// earlier segment claimed — and must not leak into the zero-fill region.
fn zero_span(seg: &SegmentDescriptor, base: u64, page: u64, claimed_end: u64) -> (u64, u64) {
    let runtime_start = base + seg.vaddr;
    if seg.memsz <= seg.filesz {
        return (runtime_start, runtime_start);
    }
    let zero_start = runtime_start + seg.filesz;
    let anon_start = anon_tail_start(seg, base, page, claimed_end);
    let zero_end = anon_start.min(page_ceil(runtime_start + seg.memsz, page));
    (zero_start, zero_end.max(zero_start))
}

/// Establish the private, copy-on-write file mapping for a segment.
fn map_file_pages(
    image: &ElfImage,
    index: usize,
    map_addr: u64,
    map_len: u64,
    file_offset: u64,
    prot: i32,
) -> Result<(), LoaderError> {
    // SAFETY: MAP_FIXED lands inside the reservation owned by this load;
    // writes never propagate back to the file (MAP_PRIVATE).
    let addr = unsafe {
        libc::mmap(
            map_addr as *mut libc::c_void,
            map_len as usize,
            prot,
            libc::MAP_PRIVATE | libc::MAP_FIXED,
            image.raw_fd(),
            file_offset as libc::off_t,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(LoaderError::MapFailed {
            index,
            addr: map_addr,
            len: map_len,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Copy head bytes landing in pages an earlier segment already owns.
///
/// The earlier segment's pages are private (copy-on-write), so writing is
/// local to this process; the claim owner's protection is restored
/// afterwards. Ownership is attributed to the segment holding the highest
/// claim; a layout where three segments meet in one page would restore
/// that segment's protection across the whole range.
fn copy_shared_head(
    image: &ElfImage,
    copy_addr: u64,
    file_start: u64,
    len: u64,
    page: u64,
    owner_prot: i32,
) -> Result<(), LoaderError> {
    let lo = page_floor(copy_addr, page);
    let hi = page_ceil(copy_addr + len, page);
    let writable = owner_prot & libc::PROT_WRITE != 0;

    if !writable {
        protect(lo, hi - lo, libc::PROT_READ | libc::PROT_WRITE)?;
    }
    let src = &image.bytes()[file_start as usize..(file_start + len) as usize];
    // SAFETY: [copy_addr, copy_addr+len) lies in pages mapped writable
    // (natively or via the mprotect above).
    unsafe {
        ptr::copy_nonoverlapping(src.as_ptr(), copy_addr as *mut u8, len as usize);
    }
    if !writable {
        protect(lo, hi - lo, owner_prot)?;
    }
    Ok(())
}

/// Map the zero pages of a BSS tail extending beyond the file-backed pages.
fn map_anonymous_tail(
    index: usize,
    map_addr: u64,
    map_len: u64,
    prot: i32,
) -> Result<(), LoaderError> {
    // SAFETY: anonymous MAP_FIXED inside the reservation; fresh pages are
    // zero-filled by the kernel.
    let addr = unsafe {
        libc::mmap(
            map_addr as *mut libc::c_void,
            map_len as usize,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(LoaderError::MapFailed {
            index,
            addr: map_addr,
            len: map_len,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Zero `len` bytes at `addr` inside pages the load already mapped.
///
/// The pages are private copies, so the write stays local; `owner_prot`
/// is the protection of the mapping holding them, lifted to writable for
/// the duration of the write when needed. A failed `mprotect` here is a
/// load failure, not something to shrug off into a faulting write.
fn zero_range(addr: u64, len: u64, owner_prot: i32, page: u64) -> Result<(), LoaderError> {
    let lo = page_floor(addr, page);
    let hi = page_ceil(addr + len, page);
    let writable = owner_prot & libc::PROT_WRITE != 0;

    if !writable {
        protect(lo, hi - lo, libc::PROT_READ | libc::PROT_WRITE)?;
    }
    // SAFETY: [addr, addr+len) lies in pages mapped writable (natively or
    // via the mprotect above).
    unsafe {
        ptr::write_bytes(addr as *mut u8, 0, len as usize);
    }
    if !writable {
        protect(lo, hi - lo, owner_prot)?;
    }
    Ok(())
}

fn protect(addr: u64, len: u64, prot: i32) -> Result<(), LoaderError> {
    // SAFETY: page-aligned range inside the reservation.
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len as usize, prot) };
    if rc != 0 {
        return Err(LoaderError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Assert that consecutive LOAD segments keep the same distance in memory
/// as in the file. A violation means the resulting address space would be
/// incoherent, and the load must not proceed to a control transfer.
fn check_relative_offsets(mapped: &[MappedSegment]) -> Result<(), LoaderError> {
    for pair in mapped.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let mem_delta = b.runtime_addr - a.runtime_addr;
        let file_delta = b.file_offset.wrapping_sub(a.file_offset);
        if mem_delta != file_delta {
            return Err(LoaderError::InvariantViolation {
                first: a.index,
                second: b.index,
                mem_delta,
                file_delta,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{PF_R, PF_W, PF_X};

    const PAGE: u64 = 0x1000;

    fn seg(vaddr: u64, offset: u64, filesz: u64, memsz: u64, flags: u32) -> SegmentDescriptor {
        SegmentDescriptor {
            index: 0,
            vaddr,
            memsz,
            offset,
            filesz,
            flags,
            align: PAGE,
        }
    }

    #[test]
    fn prot_flags_readable_only() {
        let prot = prot_flags(&seg(0, 0, 0x1000, 0x1000, PF_R));
        assert_eq!(prot, libc::PROT_READ);
    }

    #[test]
    fn prot_flags_rx() {
        let prot = prot_flags(&seg(0, 0, 0x1000, 0x1000, PF_R | PF_X));
        assert_eq!(prot, libc::PROT_READ | libc::PROT_EXEC);
    }

    #[test]
    fn prot_flags_none_is_no_access() {
        let prot = prot_flags(&seg(0, 0, 0x1000, 0x1000, 0));
        assert_eq!(prot, libc::PROT_NONE);
    }

    #[test]
    fn fresh_segment_is_one_file_mapping() {
        let steps = plan_segment(&seg(0x1234, 0x2234, 0x100, 0x100, PF_R), 0, PAGE, 0);
        assert_eq!(
            steps,
            vec![MappingStep::NeedsFileMapping {
                map_addr: 0x1000,
                map_len: 0x334,
                file_offset: 0x2000,
            }]
        );
    }

    #[test]
    fn bss_crossing_page_adds_anonymous_tail() {
        let steps = plan_segment(&seg(0x3000, 0x3000, 0x100, 0x1000, PF_R | PF_W), 0, PAGE, 0);
        assert_eq!(
            steps,
            vec![
                MappingStep::NeedsFileMapping {
                    map_addr: 0x3000,
                    map_len: 0x100,
                    file_offset: 0x3000,
                },
                // 0x100..0x1000 of the first page is zeroed in place; only
                // pages past it need fresh anonymous mappings.
            ]
        );

        let steps = plan_segment(&seg(0x3000, 0x3000, 0x100, 0x2500, PF_R | PF_W), 0, PAGE, 0);
        assert_eq!(
            steps,
            vec![
                MappingStep::NeedsFileMapping {
                    map_addr: 0x3000,
                    map_len: 0x100,
                    file_offset: 0x3000,
                },
                MappingStep::NeedsAnonymousTail {
                    map_addr: 0x4000,
                    map_len: 0x2000,
                },
            ]
        );
    }

    #[test]
    fn overlapping_head_shares_prior_mapping() {
        // Previous segment claimed through 0x2000; this one starts at
        // 0x1800 with 0x1000 file bytes.
        let steps = plan_segment(&seg(0x1800, 0x3800, 0x1000, 0x1000, PF_R), 0, PAGE, 0x2000);
        assert_eq!(
            steps,
            vec![
                MappingStep::SharesPriorMapping {
                    copy_addr: 0x1800,
                    file_start: 0x3800,
                    len: 0x800,
                },
                MappingStep::NeedsFileMapping {
                    map_addr: 0x2000,
                    map_len: 0x800,
                    file_offset: 0x4000,
                },
            ]
        );
    }

    #[test]
    fn anonymous_tail_starts_past_prior_claim() {
        // The prior claim reaches 0x2000; the tail must not remap those
        // pages even though the file bytes end back at 0xd00.
        let steps = plan_segment(&seg(0xc00, 0xc00, 0x100, 0x2300, PF_R | PF_W), 0, PAGE, 0x2000);
        assert_eq!(
            steps,
            vec![
                MappingStep::SharesPriorMapping {
                    copy_addr: 0xc00,
                    file_start: 0xc00,
                    len: 0x100,
                },
                MappingStep::NeedsAnonymousTail {
                    map_addr: 0x2000,
                    map_len: 0x1000,
                },
            ]
        );
    }

    #[test]
    fn fully_claimed_fileless_segment_needs_no_steps() {
        let steps = plan_segment(&seg(0xc00, 0xc00, 0, 0x200, PF_R | PF_W), 0, PAGE, 0x1000);
        assert!(steps.is_empty());
    }

    #[test]
    fn zero_span_covers_partial_file_page() {
        let (start, end) = zero_span(&seg(0x3000, 0x3000, 0x100, 0x1000, PF_R | PF_W), 0, PAGE, 0);
        assert_eq!((start, end), (0x3100, 0x4000));
    }

    #[test]
    fn zero_span_reaches_into_shared_page() {
        // File bytes end at 0xd00 inside a page claimed by the previous
        // segment; the rest of that page is this segment's BSS.
        let (start, end) =
            zero_span(&seg(0xc00, 0xc00, 0x100, 0x300, PF_R | PF_W), 0, PAGE, 0x1000);
        assert_eq!((start, end), (0xd00, 0x1000));
    }

    #[test]
    fn zero_span_of_fileless_shared_head() {
        // No file bytes at all, and the whole start page is claimed: the
        // head still has to read back as zeros.
        let (start, end) = zero_span(&seg(0xc00, 0xc00, 0, 0x200, PF_R | PF_W), 0, PAGE, 0x1000);
        assert_eq!((start, end), (0xc00, 0x1000));
    }

    #[test]
    fn zero_span_empty_without_bss() {
        let (start, end) = zero_span(&seg(0x1000, 0x1000, 0x800, 0x800, PF_R), 0, PAGE, 0);
        assert_eq!(start, end);
    }

    #[test]
    fn fileless_segment_is_anonymous_only() {
        let steps = plan_segment(&seg(0x5000, 0x5000, 0, 0x3000, PF_R | PF_W), 0, PAGE, 0);
        assert_eq!(
            steps,
            vec![MappingStep::NeedsAnonymousTail {
                map_addr: 0x5000,
                map_len: 0x3000,
            }]
        );
    }

    #[test]
    fn base_bias_shifts_every_step() {
        let base = 0x7f00_0000_0000;
        let steps = plan_segment(&seg(0x1000, 0x1000, 0x100, 0x100, PF_R), base, PAGE, 0);
        assert_eq!(
            steps,
            vec![MappingStep::NeedsFileMapping {
                map_addr: base + 0x1000,
                map_len: 0x100,
                file_offset: 0x1000,
            }]
        );
    }

    #[test]
    fn relative_offset_check_catches_mismatch() {
        let mapped = vec![
            MappedSegment {
                index: 0,
                runtime_addr: 0x1000,
                file_offset: 0x1000,
                memsz: 0x1000,
                prot: libc::PROT_READ,
            },
            MappedSegment {
                index: 1,
                runtime_addr: 0x3000,
                file_offset: 0x2000, // file delta 0x1000, memory delta 0x2000
                memsz: 0x1000,
                prot: libc::PROT_READ,
            },
        ];
        assert!(matches!(
            check_relative_offsets(&mapped),
            Err(LoaderError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn relative_offset_check_accepts_coherent_layout() {
        let mapped = vec![
            MappedSegment {
                index: 0,
                runtime_addr: 0x1000,
                file_offset: 0,
                memsz: 0x2000,
                prot: libc::PROT_READ,
            },
            MappedSegment {
                index: 1,
                runtime_addr: 0x4000,
                file_offset: 0x3000,
                memsz: 0x100,
                prot: libc::PROT_READ,
            },
        ];
        assert!(check_relative_offsets(&mapped).is_ok());
    }
}

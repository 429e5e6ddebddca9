//! Process creation and control transfer.
//!
//! The launcher runs the load pipeline inside a forked child so the
//! loader's temporary mappings never pollute the parent's address space,
//! places the stack image, and jumps to the computed entry point. The
//! parent supervises the child and relays its exit status.
//!
//! When the target carries PT_INTERP, the interpreter binary is loaded
//! through the same pipeline with its own independent address-space plan,
//! and control transfers to the *interpreter's* entry point; the main
//! program's entry and the interpreter's base travel in the auxiliary
//! vector instead.

use std::path::{Path, PathBuf};
use std::ptr;

use crate::elf::{self, ElfObject};
use crate::error::LoaderError;
use crate::image::ElfImage;
use crate::layout::{self, AddressSpacePlan};
use crate::segment::{self, MappedSegment};
use crate::stack::{AuxValues, StackImage};

/// Default size of the new program's stack region.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// A binary loaded into this process's address space, ready for a jump.
#[derive(Debug)]
pub struct LoadedProgram {
    /// Biased entry point
    pub entry: u64,
    /// Load bias (zero for fixed-address binaries)
    pub base: u64,
    /// Runtime address of the program-header table (0 if underivable)
    pub phdr_addr: u64,
    /// Program-header entry count
    pub phnum: u16,
    /// Program-header entry size
    pub phentsize: u16,
    /// Live mappings, in ascending address order
    pub segments: Vec<MappedSegment>,
    /// Interpreter path from PT_INTERP; loading it is the caller's job
    pub interpreter: Option<PathBuf>,
}

/// Load `path` into the current address space.
///
/// Runs the full pipeline — header validation, layout planning, segment
/// mapping — and commits the reservation only once every segment is
/// mapped and cross-checked. On any failure the reservation guard unmaps
/// everything established so far. The whole-file view is released when
/// this function returns; the file-backed segment mappings outlive it.
pub fn load(path: &Path) -> Result<LoadedProgram, LoaderError> {
    let image = ElfImage::open(path)?;
    let object = elf::parse(image.bytes())?;
    let page = layout::page_size();

    let (plan, reservation) = layout::plan(&object.load_segments, object.is_pie, page)?;
    let segments = segment::map_segments(&image, &object.load_segments, &plan, page)?;
    reservation.commit();

    let entry = plan.base + object.entry;
    let phdr_addr = phdr_runtime_addr(&object, &plan);
    log::info!(
        "[loader] {}: entry {entry:#x}, base {:#x}, {} segment(s)",
        path.display(),
        plan.base,
        segments.len()
    );

    Ok(LoadedProgram {
        entry,
        base: plan.base,
        phdr_addr,
        phnum: object.phnum,
        phentsize: object.phentsize,
        segments,
        interpreter: object.interpreter.clone().map(PathBuf::from),
    })
}

/// Runtime address of the program-header table.
///
/// PT_PHDR states it directly; otherwise it is derived from the LOAD
/// segment whose file range covers `e_phoff`.
fn phdr_runtime_addr(object: &ElfObject, plan: &AddressSpacePlan) -> u64 {
    if let Some(vaddr) = object.phdr_vaddr {
        return plan.base + vaddr;
    }
    for seg in &object.load_segments {
        if object.phoff >= seg.offset && object.phoff < seg.offset + seg.filesz {
            return plan.base + seg.vaddr + (object.phoff - seg.offset);
        }
    }
    log::warn!("[loader] program-header table is not covered by any LOAD segment");
    0
}

/// What the child process runs with.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// argv for the program; `args[0]` is the program name
    pub args: Vec<String>,
    /// Environment strings, `KEY=VALUE`
    pub envs: Vec<String>,
    /// Requested stack region size (capped by RLIMIT_STACK)
    pub stack_size: usize,
}

/// Fork a child, load and run the program there, and relay its exit
/// status. Returns the value the tool should exit with.
pub fn spawn(path: &Path, config: &LaunchConfig) -> Result<i32, LoaderError> {
    // SAFETY: plain fork; the child only uses async-signal-unsafe
    // machinery on its way to either a jump or _exit.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(LoaderError::Io(std::io::Error::last_os_error()));
    }
    if pid == 0 {
        let err = match execute(path, config) {
            Ok(never) => match never {},
            Err(err) => err,
        };
        log::error!("[loader] {}: {err}", path.display());
        // Exit status convention: 1 on any load failure.
        unsafe { libc::_exit(1) }
    }
    wait_for(pid)
}

/// Child side: build the full process image and transfer control.
/// Returns only on failure.
fn execute(path: &Path, config: &LaunchConfig) -> Result<std::convert::Infallible, LoaderError> {
    let program = load(path)?;

    let (jump_entry, interp_base) = match &program.interpreter {
        Some(interp) => {
            log::info!("[loader] chain-loading interpreter {}", interp.display());
            let interp_program = load(interp)?;
            (interp_program.entry, interp_program.base)
        }
        None => (program.entry, 0),
    };

    let page = layout::page_size();
    let budget = stack_budget(config.stack_size);
    let stack_top = map_stack_region(budget)?;

    let aux = AuxValues {
        entry: program.entry,
        phdr: program.phdr_addr,
        phent: program.phentsize as u64,
        phnum: program.phnum as u64,
        pagesz: page,
        base: interp_base,
    };
    let seed = random_seed()?;
    let image = StackImage::build(&config.args, &config.envs, &aux, &seed, stack_top, budget)?;

    let sp = image.sp();
    // SAFETY: [sp, stack_top) lies inside the anonymous RW stack region
    // mapped above.
    unsafe {
        ptr::copy_nonoverlapping(image.bytes().as_ptr(), sp as *mut u8, image.bytes().len());
    }

    log::debug!("[loader] jumping to {jump_entry:#x} with sp {sp:#x}");
    // SAFETY: entry and sp describe a fully constructed process image.
    unsafe { jump(jump_entry, sp) }
}

/// Effective stack budget: the requested size capped by RLIMIT_STACK.
fn stack_budget(requested: usize) -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: getrlimit only fills the struct.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limit) };
    if rc == 0 && limit.rlim_cur != libc::RLIM_INFINITY {
        requested.min(limit.rlim_cur as usize)
    } else {
        requested
    }
}

/// Map the anonymous region holding the new program's stack; returns the
/// region's top (16-byte aligned, since it is page-aligned).
fn map_stack_region(size: usize) -> Result<u64, LoaderError> {
    // SAFETY: fresh anonymous RW mapping, kernel-chosen placement.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(LoaderError::ReservationFailed {
            len: size as u64,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(addr as u64 + size as u64)
}

/// 16 random bytes for the AT_RANDOM security cookie.
fn random_seed() -> Result<[u8; 16], LoaderError> {
    let mut seed = [0u8; 16];
    let mut filled = 0usize;
    while filled < seed.len() {
        // SAFETY: writes at most `len - filled` bytes into `seed`.
        let rc = unsafe {
            libc::getrandom(
                seed[filled..].as_mut_ptr() as *mut libc::c_void,
                seed.len() - filled,
                0,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(LoaderError::Io(err));
        }
        filled += rc as usize;
    }
    Ok(seed)
}

/// Parent side: wait for the child and map its fate to an exit status.
fn wait_for(pid: libc::pid_t) -> Result<i32, LoaderError> {
    let mut status = 0;
    loop {
        // SAFETY: waiting on our own child.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc >= 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(LoaderError::Io(err));
        }
    }

    if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        let sig = libc::WTERMSIG(status);
        log::warn!("[loader] child terminated by signal {sig}");
        Ok(128 + sig)
    } else {
        Ok(1)
    }
}

/// Set the stack pointer and jump to the entry point.
///
/// `rdx` is cleared: the ABI reserves it for an atexit routine the
/// loader does not register. The frame pointer starts at zero per the
/// startup contract.
#[cfg(target_arch = "x86_64")]
unsafe fn jump(entry: u64, sp: u64) -> ! {
    core::arch::asm!(
        "mov rsp, {sp}",
        "xor ebp, ebp",
        "xor edx, edx",
        "jmp {entry}",
        sp = in(reg) sp,
        entry = in(reg) entry,
        options(noreturn)
    )
}

/// Set the stack pointer and jump to the entry point.
#[cfg(target_arch = "aarch64")]
unsafe fn jump(entry: u64, sp: u64) -> ! {
    core::arch::asm!(
        "mov sp, {sp}",
        "mov x29, xzr",
        "mov x30, xzr",
        "br {entry}",
        sp = in(reg) sp,
        entry = in(reg) entry,
        options(noreturn)
    )
}

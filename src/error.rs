use std::process::ExitCode;

/// All errors produced during a load attempt.
///
/// Every variant is terminal for the current load: retrying an identical
/// mapping operation against the same file and address space cannot succeed
/// differently. Failure paths release any mappings already established
/// before propagating, so a failed load never leaves a partial address
/// space behind.
#[derive(thiserror::Error, Debug)]
pub enum LoaderError {
    /// The file is not a loadable ELF64 binary (bad magic, wrong class or
    /// endianness, truncated header, or a program-header table extending
    /// past end-of-file).
    #[error("malformed ELF header: {reason}")]
    MalformedHeader { reason: String },

    /// `e_machine` does not match the host architecture.
    #[error("unsupported machine type {machine:#06x} (host expects {expected:#06x})")]
    UnsupportedMachine { machine: u16, expected: u16 },

    /// A LOAD segment's file offset and virtual address disagree on their
    /// page phase, so the file cannot back the segment with one mapping.
    #[error(
        "segment {index}: file offset {offset:#x} and vaddr {vaddr:#x} \
         disagree modulo the page size"
    )]
    BadAlignment { index: usize, offset: u64, vaddr: u64 },

    /// The contiguous address-space reservation could not be obtained.
    #[error("failed to reserve {len:#x} bytes of address space")]
    ReservationFailed {
        len: u64,
        #[source]
        source: std::io::Error,
    },

    /// A segment mapping inside the reservation failed.
    #[error("mmap failed for segment {index} at {addr:#x} (length {len:#x})")]
    MapFailed {
        index: usize,
        addr: u64,
        len: u64,
        #[source]
        source: std::io::Error,
    },

    /// Post-mapping cross-check failed: the distance between two
    /// consecutive LOAD segments in memory does not equal their distance
    /// in the file. Indicates a planner or mapper defect; the resulting
    /// address space would be incoherent.
    #[error(
        "segments {first} and {second}: memory delta {mem_delta:#x} does \
         not match file delta {file_delta:#x}"
    )]
    InvariantViolation {
        first: usize,
        second: usize,
        mem_delta: u64,
        file_delta: u64,
    },

    /// The combined size of argument strings, environment strings, pointer
    /// arrays, and the auxiliary vector exceeds the stack budget.
    #[error("stack image needs {required} bytes but the stack budget is {limit}")]
    StackOverflowBudget { required: usize, limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoaderError {
    /// Process exit code for a failed load.
    ///
    /// The tool's convention is `1` on any load failure; a successful load
    /// exits with the executed program's own status instead.
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(1)
    }
}

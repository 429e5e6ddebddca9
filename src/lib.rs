//! User-space ELF64 program loader.
//!
//! Reimplements the program-loading half of `execve` with ordinary process
//! primitives: validate the ELF header, reserve one contiguous region for
//! all LOAD segments, map them copy-on-write from the file, build the
//! argc/argv/envp/auxv stack block, and jump to the entry point inside a
//! forked child. Dynamically linked binaries are handled by chain-loading
//! the PT_INTERP interpreter and letting it do the relocation work.
//!
//! The pipeline is exposed piecewise so each stage can be driven and
//! inspected on its own:
//!
//! - [`elf`]: header and program-header parsing and validation
//! - [`image`]: read-only whole-file mapping
//! - [`layout`]: span computation, reservation, load bias
//! - [`segment`]: per-segment mapping and BSS zeroing
//! - [`stack`]: initial stack image construction
//! - [`launcher`]: fork, load, control transfer, status relay

pub mod cli;
pub mod elf;
pub mod error;
pub mod image;
pub mod launcher;
pub mod layout;
pub mod segment;
pub mod stack;

pub use error::LoaderError;
pub use launcher::{LaunchConfig, LoadedProgram};

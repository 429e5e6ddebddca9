//! End-to-end loader tests against synthetic ELF binaries.

#![cfg(target_os = "linux")]

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use elfexec::elf::{
    ELFCLASS64, ELFDATA2LSB, ELF_MAGIC, EM_HOST, ET_DYN, ET_EXEC, PF_R, PF_W, PF_X, PT_LOAD,
};
use elfexec::launcher;
use elfexec::LoaderError;

const EHSIZE: usize = 64;
const PHENTSIZE: usize = 56;

struct Phdr {
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
}

/// Assemble an ELF64 binary for the host architecture from program
/// headers and `(offset, bytes)` payload patches.
fn build_elf(e_type: u16, entry: u64, phdrs: &[Phdr], payload: &[(usize, &[u8])]) -> Vec<u8> {
    let mut len = EHSIZE + phdrs.len() * PHENTSIZE;
    for ph in phdrs {
        len = len.max((ph.offset + ph.filesz) as usize);
    }
    for (off, bytes) in payload {
        len = len.max(off + bytes.len());
    }
    let mut elf = vec![0u8; len];

    elf[0..4].copy_from_slice(&ELF_MAGIC);
    elf[4] = ELFCLASS64;
    elf[5] = ELFDATA2LSB;
    elf[6] = 1;
    elf[16..18].copy_from_slice(&e_type.to_le_bytes());
    elf[18..20].copy_from_slice(&EM_HOST.to_le_bytes());
    elf[20..24].copy_from_slice(&1u32.to_le_bytes());
    elf[24..32].copy_from_slice(&entry.to_le_bytes());
    elf[32..40].copy_from_slice(&(EHSIZE as u64).to_le_bytes());
    elf[52..54].copy_from_slice(&(EHSIZE as u16).to_le_bytes());
    elf[54..56].copy_from_slice(&(PHENTSIZE as u16).to_le_bytes());
    elf[56..58].copy_from_slice(&(phdrs.len() as u16).to_le_bytes());

    for (i, ph) in phdrs.iter().enumerate() {
        let at = EHSIZE + i * PHENTSIZE;
        elf[at..at + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        elf[at + 4..at + 8].copy_from_slice(&ph.flags.to_le_bytes());
        elf[at + 8..at + 16].copy_from_slice(&ph.offset.to_le_bytes());
        elf[at + 16..at + 24].copy_from_slice(&ph.vaddr.to_le_bytes());
        elf[at + 24..at + 32].copy_from_slice(&ph.vaddr.to_le_bytes());
        elf[at + 32..at + 40].copy_from_slice(&ph.filesz.to_le_bytes());
        elf[at + 40..at + 48].copy_from_slice(&ph.memsz.to_le_bytes());
        elf[at + 48..at + 56].copy_from_slice(&0x1000u64.to_le_bytes());
    }

    for (off, bytes) in payload {
        elf[*off..off + bytes.len()].copy_from_slice(bytes);
    }
    elf
}

fn write_elf(bytes: &[u8]) -> NamedTempFile {
    let mut tmp = NamedTempFile::new().unwrap();
    tmp.write_all(bytes).unwrap();
    tmp.flush().unwrap();
    tmp
}

fn read_memory(addr: u64, len: usize) -> Vec<u8> {
    // SAFETY: tests only read ranges they just had the loader map.
    unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec()
}

#[test]
fn pie_load_biases_addresses_and_zeroes_bss() {
    // Segment A: R+X, file bytes [0, 0x2000) at vaddr 0.
    // Segment B: R+W, 0x100 file bytes at vaddr 0x3000, memsz 0x1000 (BSS).
    let marker = b"segment-b-data";
    let elf = build_elf(
        ET_DYN,
        0x1000,
        &[
            Phdr {
                flags: PF_R | PF_X,
                offset: 0,
                vaddr: 0,
                filesz: 0x2000,
                memsz: 0x2000,
            },
            Phdr {
                flags: PF_R | PF_W,
                offset: 0x3000,
                vaddr: 0x3000,
                filesz: 0x100,
                memsz: 0x1000,
            },
        ],
        &[(0x3000, marker)],
    );
    let tmp = write_elf(&elf);

    let program = launcher::load(tmp.path()).unwrap();
    assert_ne!(program.base, 0);
    assert_eq!(program.entry, program.base + 0x1000);
    assert_eq!(program.segments.len(), 2);
    assert!(program.interpreter.is_none());

    // Segment A carries the file's own header bytes.
    assert_eq!(&read_memory(program.base, 4), &ELF_MAGIC);

    // Segment B lands at base + 0x3000 with its file bytes in front...
    let b_addr = program.base + 0x3000;
    assert_eq!(&read_memory(b_addr, marker.len()), marker);
    // ...and zeros from filesz through memsz.
    let tail = read_memory(b_addr + 0x100, 0x1000 - 0x100);
    assert!(tail.iter().all(|&b| b == 0));
}

#[test]
fn writable_bss_in_shared_read_execute_page_is_zeroed() {
    // B's file bytes and BSS tail both live inside the page A's R+X
    // mapping claimed; zeroing the tail must survive A's protection.
    let marker = b"segment-b-file-bytes";
    let elf = build_elf(
        ET_DYN,
        0,
        &[
            Phdr {
                flags: PF_R | PF_X,
                offset: 0,
                vaddr: 0,
                filesz: 0xc00,
                memsz: 0xc00,
            },
            Phdr {
                flags: PF_R | PF_W,
                offset: 0xc00,
                vaddr: 0xc00,
                filesz: 0x100,
                memsz: 0x300,
            },
        ],
        &[(0xc00, marker)],
    );
    let tmp = write_elf(&elf);

    let program = launcher::load(tmp.path()).unwrap();
    let b_addr = program.base + 0xc00;
    assert_eq!(&read_memory(b_addr, marker.len()), marker);
    let tail = read_memory(b_addr + 0x100, 0x200);
    assert!(tail.iter().all(|&b| b == 0));
}

#[test]
fn fileless_bss_in_shared_page_reads_zero() {
    // The file stores stray bytes exactly where B's zero-fill region
    // lands inside A's page; they must not show through.
    let elf = build_elf(
        ET_DYN,
        0,
        &[
            Phdr {
                flags: PF_R | PF_X,
                offset: 0,
                vaddr: 0,
                filesz: 0xc00,
                memsz: 0xc00,
            },
            Phdr {
                flags: PF_R | PF_W,
                offset: 0xc00,
                vaddr: 0xc00,
                filesz: 0,
                memsz: 0x200,
            },
        ],
        &[(0xc00, &[0x5a; 0x40])],
    );
    let tmp = write_elf(&elf);

    let program = launcher::load(tmp.path()).unwrap();
    let region = read_memory(program.base + 0xc00, 0x200);
    assert!(region.iter().all(|&b| b == 0));
}

#[test]
fn fixed_address_load_has_zero_bias() {
    let elf = build_elf(
        ET_EXEC,
        0x400000,
        &[Phdr {
            flags: PF_R | PF_X,
            offset: 0,
            vaddr: 0x400000,
            filesz: 0x1000,
            memsz: 0x1000,
        }],
        &[],
    );
    let tmp = write_elf(&elf);

    let program = launcher::load(tmp.path()).unwrap();
    assert_eq!(program.base, 0);
    assert_eq!(program.entry, 0x400000);
    assert_eq!(program.segments[0].runtime_addr, 0x400000);
    assert_eq!(&read_memory(0x400000, 4), &ELF_MAGIC);
}

#[test]
fn phdr_address_is_derived_when_pt_phdr_is_absent() {
    let elf = build_elf(
        ET_DYN,
        0x0,
        &[Phdr {
            flags: PF_R,
            offset: 0,
            vaddr: 0,
            filesz: 0x1000,
            memsz: 0x1000,
        }],
        &[],
    );
    let tmp = write_elf(&elf);

    let program = launcher::load(tmp.path()).unwrap();
    // e_phoff is 64 and the LOAD covers it from vaddr 0.
    assert_eq!(program.phdr_addr, program.base + EHSIZE as u64);
    assert_eq!(program.phnum, 1);
}

#[test]
fn bad_magic_is_rejected() {
    let mut elf = build_elf(
        ET_EXEC,
        0x400000,
        &[Phdr {
            flags: PF_R,
            offset: 0,
            vaddr: 0x400000,
            filesz: 0x1000,
            memsz: 0x1000,
        }],
        &[],
    );
    elf[0] = 0;
    let tmp = write_elf(&elf);
    assert!(matches!(
        launcher::load(tmp.path()),
        Err(LoaderError::MalformedHeader { .. })
    ));
}

#[test]
fn page_phase_mismatch_is_rejected() {
    // offset and vaddr disagree modulo the page size.
    let elf = build_elf(
        ET_DYN,
        0,
        &[Phdr {
            flags: PF_R,
            offset: 0x200,
            vaddr: 0x700,
            filesz: 0x100,
            memsz: 0x100,
        }],
        &[],
    );
    let tmp = write_elf(&elf);
    assert!(matches!(
        launcher::load(tmp.path()),
        Err(LoaderError::BadAlignment { .. })
    ));
}

#[test]
fn truncated_file_is_rejected() {
    let tmp = write_elf(&[0x7F, b'E', b'L', b'F', ELFCLASS64]);
    assert!(matches!(
        launcher::load(tmp.path()),
        Err(LoaderError::MalformedHeader { .. })
    ));
}

#[test]
fn missing_program_is_an_io_error() {
    let result = launcher::load(Path::new("/nonexistent/elfexec-target"));
    assert!(matches!(result, Err(LoaderError::Io(_))));
}

/// Full pipeline: fork, load a hand-assembled binary, jump, relay status.
///
/// The payload is twelve bytes of machine code:
///
/// ```text
///   b8 3c 00 00 00    mov eax, 60   ; SYS_exit
///   bf 2a 00 00 00    mov edi, 42
///   0f 05             syscall
/// ```
#[test]
#[cfg(target_arch = "x86_64")]
fn spawned_program_runs_and_exit_status_is_relayed() {
    let code: &[u8] = &[
        0xb8, 0x3c, 0x00, 0x00, 0x00, // mov eax, 60
        0xbf, 0x2a, 0x00, 0x00, 0x00, // mov edi, 42
        0x0f, 0x05, // syscall
    ];
    let elf = build_elf(
        ET_EXEC,
        0x411000,
        &[Phdr {
            flags: PF_R | PF_X,
            offset: 0,
            vaddr: 0x410000,
            filesz: 0x1000 + code.len() as u64,
            memsz: 0x1000 + code.len() as u64,
        }],
        &[(0x1000, code)],
    );
    let tmp = write_elf(&elf);

    let config = launcher::LaunchConfig {
        args: vec!["payload".into()],
        envs: vec![],
        stack_size: launcher::DEFAULT_STACK_SIZE,
    };
    let status = launcher::spawn(tmp.path(), &config).unwrap();
    assert_eq!(status, 42);
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: ELF64 image planning for the demand loader
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests + tests/image.rs
//!
//! PUBLIC API: parse_exec(), parse_exec_file(), start::launch(), LoadPlan, SegmentPlan, Prot
//!
//! Parsing only describes where segments live and which file bytes back them.
//! Nothing in this module maps memory; the demand loader materializes pages
//! lazily and [`start::launch`] transfers control once the fault handler is up.

#![deny(unsafe_code)]

use core::cmp::Ordering;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use goblin::elf::{
    header::{self, header64::SIZEOF_EHDR},
    program_header::{ProgramHeader, PF_R, PF_W, PF_X, PT_DYNAMIC, PT_INTERP, PT_LOAD, PT_PHDR},
    Elf,
};
use thiserror::Error;

pub mod start;

/// ELF machine accepted by [`parse_exec`] on this host.
#[cfg(target_arch = "x86_64")]
pub const HOST_MACHINE: u16 = header::EM_X86_64;
/// ELF machine accepted by [`parse_exec`] on this host.
#[cfg(target_arch = "aarch64")]
pub const HOST_MACHINE: u16 = header::EM_AARCH64;
/// ELF machine accepted by [`parse_exec`] on this host.
#[cfg(target_arch = "riscv64")]
pub const HOST_MACHINE: u16 = header::EM_RISCV;
/// ELF machine accepted by [`parse_exec`] on this host.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")))]
pub const HOST_MACHINE: u16 = header::EM_NONE;

bitflags! {
    /// Memory protection bits for a mapped segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Prot: u32 {
        const R = 0x1;
        const W = 0x2;
        const X = 0x4;
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid ELF: {0}")]
    InvalidElf(&'static str),
    #[error("unsupported feature: {0}")]
    Unsupported(&'static str),
    #[error("w^x violation for segment at {0:#x}")]
    ProtWx(u64),
    #[error("segment alignment error")]
    Align,
    #[error("segments at {first:#x} and {second:#x} share a page")]
    Overlap { first: u64, second: u64 },
    #[error("value out of bounds")]
    Oob,
    #[error("ELF truncated")]
    Truncated,
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// One loadable segment, normalized so `vaddr` and `off` are page aligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    pub vaddr: u64,
    pub memsz: u64,
    pub filesz: u64,
    pub off: u64,
    pub prot: Prot,
}

impl SegmentPlan {
    /// First address past the segment.
    pub fn end(&self) -> Option<u64> {
        self.vaddr.checked_add(self.memsz)
    }
}

/// Parsed executable: segments in address order plus start-up metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    pub entry: u64,
    pub segments: Vec<SegmentPlan>,
    /// In-memory address of the program header table, when it is loaded.
    pub phdr: Option<u64>,
    pub phent: u16,
    pub phnum: u16,
}

impl LoadPlan {
    /// Builds a plan without program header metadata.
    pub fn new(entry: u64, segments: Vec<SegmentPlan>) -> Self {
        Self { entry, segments, phdr: None, phent: 0, phnum: 0 }
    }
}

/// Reads `path` and parses it with [`parse_exec`].
pub fn parse_exec_file(path: &Path, page_size: u64) -> Result<LoadPlan, Error> {
    let bytes = std::fs::read(path).map_err(|source| Error::Io { path: path.to_path_buf(), source })?;
    parse_exec(&bytes, page_size)
}

pub fn parse_exec(bytes: &[u8], page_size: u64) -> Result<LoadPlan, Error> {
    if !page_size.is_power_of_two() {
        return Err(Error::Align);
    }
    if bytes.len() < SIZEOF_EHDR {
        return Err(Error::Truncated);
    }
    if &bytes[..header::SELFMAG] != header::ELFMAG {
        return Err(Error::InvalidElf("bad magic"));
    }

    let elf = Elf::parse(bytes).map_err(|_| Error::InvalidElf("parse error"))?;

    if elf.header.e_ident[header::EI_CLASS] != header::ELFCLASS64 {
        return Err(Error::Unsupported("not ELF64"));
    }
    if elf.header.e_ident[header::EI_DATA] != header::ELFDATA2LSB {
        return Err(Error::Unsupported("not little endian"));
    }
    if elf.header.e_machine != HOST_MACHINE {
        return Err(Error::Unsupported("unexpected machine"));
    }
    match elf.header.e_type {
        header::ET_EXEC => {}
        header::ET_DYN => return Err(Error::Unsupported("position-independent executable")),
        _ => return Err(Error::InvalidElf("not an executable")),
    }

    let mut segments = Vec::new();
    let mut phdr = None;
    for ph in &elf.program_headers {
        match ph.p_type {
            PT_LOAD => segments.push(segment_from_program(ph, bytes, page_size)?),
            PT_PHDR => phdr = Some(ph.p_vaddr),
            PT_INTERP | PT_DYNAMIC => return Err(Error::Unsupported("dynamically linked executable")),
            _ => {}
        }
    }

    if segments.is_empty() {
        return Err(Error::Unsupported("no PT_LOAD segments"));
    }

    segments.sort_by(|a, b| match a.vaddr.cmp(&b.vaddr) {
        Ordering::Equal => a.off.cmp(&b.off),
        other => other,
    });
    reject_shared_pages(&segments, page_size)?;

    let phdr = match phdr {
        Some(vaddr) => Some(vaddr),
        None => phdr_from_loads(&segments, elf.header.e_phoff),
    };

    Ok(LoadPlan {
        entry: elf.header.e_entry,
        segments,
        phdr,
        phent: elf.header.e_phentsize,
        phnum: elf.header.e_phnum,
    })
}

fn segment_from_program(ph: &ProgramHeader, bytes: &[u8], page_size: u64) -> Result<SegmentPlan, Error> {
    if ph.p_align < page_size {
        return Err(Error::Align);
    }
    if ph.p_filesz > ph.p_memsz {
        return Err(Error::InvalidElf("filesz larger than memsz"));
    }
    let delta = ph.p_vaddr & (page_size - 1);
    if ph.p_offset & (page_size - 1) != delta {
        return Err(Error::Align);
    }

    let prot = prot_from_flags(ph.p_flags).map_err(|_| Error::ProtWx(ph.p_vaddr))?;

    let end = ph.p_offset.checked_add(ph.p_filesz).ok_or(Error::Oob)?;
    if end > bytes.len() as u64 {
        return Err(Error::Truncated);
    }
    ph.p_vaddr.checked_add(ph.p_memsz).ok_or(Error::Oob)?;

    Ok(SegmentPlan {
        vaddr: ph.p_vaddr - delta,
        memsz: ph.p_memsz + delta,
        filesz: ph.p_filesz + delta,
        off: ph.p_offset - delta,
        prot,
    })
}

fn prot_from_flags(flags: u32) -> Result<Prot, Error> {
    let mut prot = Prot::empty();
    if flags & PF_R != 0 {
        prot |= Prot::R;
    }
    if flags & PF_W != 0 {
        prot |= Prot::W;
    }
    if flags & PF_X != 0 {
        prot |= Prot::X;
    }
    if prot.contains(Prot::W) && prot.contains(Prot::X) {
        return Err(Error::ProtWx(0));
    }
    Ok(prot)
}

// Segments arrive sorted; a page may belong to at most one of them.
fn reject_shared_pages(segments: &[SegmentPlan], page_size: u64) -> Result<(), Error> {
    for pair in segments.windows(2) {
        let end = pair[0].end().ok_or(Error::Oob)?;
        let last_page_end = end.checked_add(page_size - 1).ok_or(Error::Oob)? & !(page_size - 1);
        if pair[1].vaddr < last_page_end {
            return Err(Error::Overlap { first: pair[0].vaddr, second: pair[1].vaddr });
        }
    }
    Ok(())
}

fn phdr_from_loads(segments: &[SegmentPlan], phoff: u64) -> Option<u64> {
    segments
        .iter()
        .find(|seg| phoff >= seg.off && phoff - seg.off < seg.filesz)
        .map(|seg| seg.vaddr + (phoff - seg.off))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn seg(vaddr: u64, memsz: u64) -> SegmentPlan {
        SegmentPlan { vaddr, memsz, filesz: 0, off: 0, prot: Prot::R }
    }

    #[test]
    fn wx_flags_rejected() {
        assert!(prot_from_flags(PF_W | PF_X).is_err());
        assert_eq!(prot_from_flags(PF_R | PF_X).unwrap(), Prot::R | Prot::X);
    }

    #[test]
    fn shared_page_is_overlap() {
        let segments = [seg(0x1000, 0x10), seg(0x1800, 0x10)];
        let err = reject_shared_pages(&segments, 0x1000).expect_err("shared page");
        assert!(matches!(err, Error::Overlap { first: 0x1000, second: 0x1800 }));
    }

    #[test]
    fn adjacent_pages_accepted() {
        let segments = [seg(0x1000, 0x1001), seg(0x3000, 0x10)];
        reject_shared_pages(&segments, 0x1000).expect("disjoint pages");
    }

    #[test]
    fn phdr_derived_from_covering_load() {
        let mut text = seg(0x40_0000, 0x2000);
        text.filesz = 0x2000;
        assert_eq!(phdr_from_loads(&[text], 0x40), Some(0x40_0040));
        assert_eq!(phdr_from_loads(&[seg(0x40_0000, 0x2000)], 0x40), None);
    }

    proptest! {
        #[test]
        fn normalized_segment_covers_original_range(
            page in 0u64..0x1000,
            delta in 0u64..0x1000,
            filesz in 0u64..0x3000,
            extra in 0u64..0x3000,
        ) {
            const PAGE: u64 = 0x1000;
            let ph = ProgramHeader {
                p_type: PT_LOAD,
                p_flags: PF_R,
                p_offset: PAGE + delta,
                p_vaddr: 0x40_0000 + page * PAGE + delta,
                p_filesz: filesz,
                p_memsz: filesz + extra,
                p_align: PAGE,
                ..ProgramHeader::default()
            };
            let bytes = vec![0u8; (PAGE + delta + filesz) as usize];
            let plan = segment_from_program(&ph, &bytes, PAGE).expect("valid segment");
            prop_assert_eq!(plan.vaddr % PAGE, 0);
            prop_assert_eq!(plan.off % PAGE, 0);
            prop_assert_eq!(plan.vaddr + plan.memsz, ph.p_vaddr + ph.p_memsz);
            prop_assert_eq!(plan.off + plan.filesz, ph.p_offset + ph.p_filesz);
        }
    }
}

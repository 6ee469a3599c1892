// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Program start: builds a System V initial stack and jumps to the entry point.
//!
//! Segment memory is never touched here. The first instruction fetched from
//! the entry point faults and is served by whoever owns the fault handler.

#![allow(unsafe_code)]

use std::convert::Infallible;
use std::ptr;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::{Error, LoadPlan};

/// Size of the anonymous stack handed to the launched program.
pub const STACK_SIZE: usize = 8 * 1024 * 1024;

pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_PAGESZ: u64 = 6;
pub const AT_ENTRY: u64 = 9;
pub const AT_UID: u64 = 11;
pub const AT_EUID: u64 = 12;
pub const AT_GID: u64 = 13;
pub const AT_EGID: u64 = 14;
pub const AT_SECURE: u64 = 23;
pub const AT_RANDOM: u64 = 25;

const WORD: usize = core::mem::size_of::<u64>();

/// Addresses produced by [`layout_initial_stack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackLayout {
    /// Initial stack pointer; points at `argc`.
    pub sp: u64,
    pub argv: u64,
    pub env: u64,
    pub auxv: u64,
    pub random: u64,
}

/// Maps a stack, lays out `argv`/`env`/auxv and jumps to `plan.entry`.
///
/// Only returns on failure.
pub fn launch<A, E>(plan: &LoadPlan, argv: &[A], env: &[E], page_size: u64) -> Result<Infallible, Error>
where
    A: AsRef<[u8]>,
    E: AsRef<[u8]>,
{
    let auxv = auxv_for(plan, page_size);
    let random = random_bytes()?;

    // Dropped, and so unmapped, on every path that returns.
    let mut stack = Stack::map(STACK_SIZE)?;
    let base = stack.base;
    let layout = layout_initial_stack(stack.bytes(), base, argv, env, &auxv, &random)?;

    log::debug!(
        "exec-image: launch entry={:#x} sp={:#x} argc={} envc={}",
        plan.entry,
        layout.sp,
        argv.len(),
        env.len()
    );
    // SAFETY: the stack is laid out per the System V ABI and the entry point belongs to the
    // plan the caller attached to its fault handler.
    unsafe { jump_to_entry(plan.entry, layout.sp) }
}

/// Auxiliary vector entries for `plan`, without the trailing `AT_RANDOM`/`AT_NULL`.
pub fn auxv_for(plan: &LoadPlan, page_size: u64) -> Vec<(u64, u64)> {
    let mut auxv = Vec::with_capacity(11);
    if let Some(phdr) = plan.phdr {
        auxv.push((AT_PHDR, phdr));
    }
    auxv.push((AT_PHENT, u64::from(plan.phent)));
    auxv.push((AT_PHNUM, u64::from(plan.phnum)));
    auxv.push((AT_PAGESZ, page_size));
    auxv.push((AT_ENTRY, plan.entry));
    // SAFETY: the id getters have no preconditions and cannot fail.
    let (uid, euid, gid, egid) = unsafe { (libc::getuid(), libc::geteuid(), libc::getgid(), libc::getegid()) };
    auxv.push((AT_UID, u64::from(uid)));
    auxv.push((AT_EUID, u64::from(euid)));
    auxv.push((AT_GID, u64::from(gid)));
    auxv.push((AT_EGID, u64::from(egid)));
    auxv.push((AT_SECURE, 0));
    auxv
}

/// Writes the initial process stack into `image`, which is mapped at `base`.
///
/// Layout from the returned `sp` upwards: argc, argv pointers, NULL, envp
/// pointers, NULL, auxv pairs ending with `AT_NULL`; strings and the
/// `AT_RANDOM` bytes sit at the top of the buffer.
pub fn layout_initial_stack<A, E>(
    image: &mut [u8],
    base: u64,
    argv: &[A],
    env: &[E],
    auxv: &[(u64, u64)],
    random: &[u8; 16],
) -> Result<StackLayout, Error>
where
    A: AsRef<[u8]>,
    E: AsRef<[u8]>,
{
    let mut cursor = image.len();
    let random_ptr = push_bytes(image, &mut cursor, base, random)?;

    let mut env_ptrs = Vec::with_capacity(env.len());
    for value in env.iter().rev() {
        env_ptrs.push(push_string(image, &mut cursor, base, value.as_ref())?);
    }
    env_ptrs.reverse();
    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for value in argv.iter().rev() {
        argv_ptrs.push(push_string(image, &mut cursor, base, value.as_ref())?);
    }
    argv_ptrs.reverse();

    // argc + argv + NULL + envp + NULL + (auxv + AT_RANDOM + AT_NULL) pairs
    let words = 1 + argv_ptrs.len() + 1 + env_ptrs.len() + 1 + 2 * (auxv.len() + 2);
    let needed = words * WORD;
    if cursor < needed {
        return Err(Error::Internal("stack overflow"));
    }
    let start = align_down(cursor - needed, 16);

    let mut at = start;
    let mut put = |value: u64| {
        write_u64(image, at, value);
        at += WORD;
    };
    put(argv_ptrs.len() as u64);
    let argv_block = base + (start + WORD) as u64;
    argv_ptrs.iter().for_each(|ptr| put(*ptr));
    put(0);
    let env_block = base + (start + (2 + argv_ptrs.len()) * WORD) as u64;
    env_ptrs.iter().for_each(|ptr| put(*ptr));
    put(0);
    let auxv_block = base + (start + (3 + argv_ptrs.len() + env_ptrs.len()) * WORD) as u64;
    for (key, value) in auxv {
        put(*key);
        put(*value);
    }
    put(AT_RANDOM);
    put(random_ptr);
    put(AT_NULL);
    put(0);

    let sp = base + start as u64;
    debug_assert_eq!(sp & 0xf, 0);
    Ok(StackLayout { sp, argv: argv_block, env: env_block, auxv: auxv_block, random: random_ptr })
}

fn push_string(image: &mut [u8], cursor: &mut usize, base: u64, value: &[u8]) -> Result<u64, Error> {
    if value.contains(&0) {
        return Err(Error::Internal("argument contains NUL"));
    }
    let needed = value.len() + 1; // include NUL
    if *cursor < needed {
        return Err(Error::Internal("stack overflow"));
    }
    *cursor -= needed;
    let start = *cursor;
    image[start..start + value.len()].copy_from_slice(value);
    image[start + value.len()] = 0;
    Ok(base + start as u64)
}

fn push_bytes(image: &mut [u8], cursor: &mut usize, base: u64, value: &[u8]) -> Result<u64, Error> {
    if *cursor < value.len() {
        return Err(Error::Internal("stack overflow"));
    }
    *cursor -= value.len();
    image[*cursor..*cursor + value.len()].copy_from_slice(value);
    Ok(base + *cursor as u64)
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + WORD].copy_from_slice(&value.to_ne_bytes());
}

fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Seed for the program's stack protector and pointer guard.
fn random_bytes() -> Result<[u8; 16], Error> {
    let mut out = [0u8; 16];
    OsRng.try_fill_bytes(&mut out).map_err(|_| Error::Internal("no entropy for AT_RANDOM"))?;
    Ok(out)
}

/// Anonymous stack mapping for the launched program.
struct Stack {
    base: u64,
    len: usize,
}

impl Stack {
    fn map(len: usize) -> Result<Self, Error> {
        // SAFETY: anonymous mapping at a kernel-chosen address; no existing memory is affected.
        let mapped = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(Error::Internal("stack mmap"));
        }
        Ok(Self { base: mapped as u64, len })
    }

    fn bytes(&mut self) -> &mut [u8] {
        // SAFETY: `base` is a private RW mapping of `len` bytes owned by `self`.
        unsafe { std::slice::from_raw_parts_mut(self.base as *mut u8, self.len) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned by `self` and no borrow of it outlives `self`.
        if unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) } != 0 {
            log::warn!("exec-image: stack munmap failed: {}", std::io::Error::last_os_error());
        }
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn jump_to_entry(entry: u64, sp: u64) -> Result<Infallible, Error> {
    // rdx carries the rtld_fini pointer; a static image gets none.
    core::arch::asm!(
        "mov rsp, rsi",
        "xor ebp, ebp",
        "xor edx, edx",
        "jmp rax",
        in("rsi") sp,
        in("rax") entry,
        options(noreturn)
    );
}

#[cfg(target_arch = "aarch64")]
unsafe fn jump_to_entry(entry: u64, sp: u64) -> Result<Infallible, Error> {
    core::arch::asm!(
        "mov sp, x1",
        "mov x29, xzr",
        "mov x30, xzr",
        "mov x0, xzr",
        "br x2",
        in("x1") sp,
        in("x2") entry,
        options(noreturn)
    );
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn jump_to_entry(_entry: u64, _sp: u64) -> Result<Infallible, Error> {
    Err(Error::Unsupported("program start on this architecture"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x7000_0000;

    fn read_u64(image: &[u8], addr: u64) -> u64 {
        let off = (addr - BASE) as usize;
        u64::from_ne_bytes(image[off..off + 8].try_into().unwrap())
    }

    fn read_cstr(image: &[u8], addr: u64) -> &[u8] {
        let off = (addr - BASE) as usize;
        let len = image[off..].iter().position(|b| *b == 0).unwrap();
        &image[off..off + len]
    }

    #[test]
    fn layout_follows_sysv_order() {
        let mut image = vec![0u8; 4096];
        let random = [7u8; 16];
        let layout = layout_initial_stack(
            &mut image,
            BASE,
            &["prog", "-v"],
            &["HOME=/root"],
            &[(AT_PAGESZ, 4096)],
            &random,
        )
        .expect("layout");

        assert_eq!(layout.sp & 0xf, 0);
        assert_eq!(read_u64(&image, layout.sp), 2);
        assert_eq!(layout.argv, layout.sp + 8);
        assert_eq!(read_cstr(&image, read_u64(&image, layout.argv)), b"prog");
        assert_eq!(read_cstr(&image, read_u64(&image, layout.argv + 8)), b"-v");
        assert_eq!(read_u64(&image, layout.argv + 16), 0);
        assert_eq!(layout.env, layout.argv + 24);
        assert_eq!(read_cstr(&image, read_u64(&image, layout.env)), b"HOME=/root");
        assert_eq!(read_u64(&image, layout.env + 8), 0);

        let aux = layout.auxv;
        assert_eq!((read_u64(&image, aux), read_u64(&image, aux + 8)), (AT_PAGESZ, 4096));
        assert_eq!(read_u64(&image, aux + 16), AT_RANDOM);
        assert_eq!(read_u64(&image, aux + 24), layout.random);
        assert_eq!((read_u64(&image, aux + 32), read_u64(&image, aux + 40)), (AT_NULL, 0));
        let off = (layout.random - BASE) as usize;
        assert_eq!(&image[off..off + 16], &random);
    }

    #[test]
    fn empty_argv_still_terminated() {
        let mut image = vec![0u8; 512];
        let none: [&str; 0] = [];
        let layout = layout_initial_stack(&mut image, BASE, &none, &none, &[], &[0; 16]).expect("layout");
        assert_eq!(read_u64(&image, layout.sp), 0);
        assert_eq!(read_u64(&image, layout.argv), 0);
        assert_eq!(read_u64(&image, layout.env), 0);
    }

    #[test]
    fn small_stack_overflows() {
        let mut image = vec![0u8; 64];
        let err = layout_initial_stack(&mut image, BASE, &["a-long-argument-string"], &["X=1"], &[], &[0; 16])
            .expect_err("overflow");
        assert!(matches!(err, Error::Internal("stack overflow")));
    }

    #[test]
    fn nul_in_argument_rejected() {
        let mut image = vec![0u8; 512];
        let none: [&str; 0] = [];
        let err = layout_initial_stack(&mut image, BASE, &[b"a\0b".as_slice()], &none, &[], &[0; 16])
            .expect_err("nul rejected");
        assert!(matches!(err, Error::Internal("argument contains NUL")));
    }

    #[test]
    fn auxv_reports_page_size_and_entry() {
        let plan = LoadPlan::new(0x40_1000, Vec::new());
        let auxv = auxv_for(&plan, 4096);
        assert!(auxv.contains(&(AT_PAGESZ, 4096)));
        assert!(auxv.contains(&(AT_ENTRY, 0x40_1000)));
        assert!(auxv.iter().all(|(key, _)| *key != AT_PHDR));
    }

    #[test]
    fn dropped_stack_is_unmapped() {
        let mut stack = Stack::map(64 * 1024).expect("map");
        stack.bytes()[0] = 1;
        let base = stack.base;
        drop(stack);
        // mincore reports ENOMEM for unmapped ranges.
        let mut vec = [0u8; 1];
        let rc = unsafe { libc::mincore(base as *mut libc::c_void, 4096, vec.as_mut_ptr()) };
        assert_eq!(rc, -1);
        assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::ENOMEM));
    }

    #[test]
    fn failed_launch_returns_error() {
        let plan = LoadPlan::new(0x40_1000, Vec::new());
        let none: [&str; 0] = [];
        let err = launch(&plan, &[b"a\0b".as_slice()], &none, 4096).expect_err("nul rejected");
        assert!(matches!(err, Error::Internal("argument contains NUL")));
    }

    #[test]
    fn random_bytes_differ_between_calls() {
        assert_ne!(random_bytes().expect("entropy"), random_bytes().expect("entropy"));
    }
}

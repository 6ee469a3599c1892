// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address-space operations used to materialize a page.
//!
//! [`HostSpace`] calls straight into libc so it stays usable from the fault
//! handler: no allocation, no locking, no logging.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use exec_image::Prot;
use thiserror::Error;

use crate::Error as LoaderError;

/// Failure of a single address-space call, carrying the OS errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpaceError {
    #[error("mmap failed (errno {0})")]
    Map(i32),
    #[error("open failed (errno {0})")]
    Open(i32),
    #[error("read failed (errno {0})")]
    Read(i32),
    #[error("mprotect failed (errno {0})")]
    Protect(i32),
    #[error("munmap failed (errno {0})")]
    Unmap(i32),
}

/// Operations the fault resolver needs from the process address space.
pub trait AddressSpace {
    /// Replaces `[addr, addr + len)` with a fresh zeroed, writable, private mapping.
    fn map_fresh(&self, addr: u64, len: usize) -> Result<(), SpaceError>;

    /// Copies up to `len` bytes of the executable starting at `file_offset`
    /// to `addr`. Returns the number of bytes copied; a short count means
    /// the file ended early.
    fn fill_from_file(&self, addr: u64, file_offset: u64, len: usize) -> Result<usize, SpaceError>;

    /// Applies `prot` to `[addr, addr + len)`.
    fn protect(&self, addr: u64, len: usize, prot: Prot) -> Result<(), SpaceError>;

    /// Removes a mapping made by `map_fresh` whose page could not be completed.
    fn release(&self, addr: u64, len: usize) -> Result<(), SpaceError>;
}

/// The calling process's address space, backed by the executable at `path`.
///
/// The file is opened fresh for every page and closed afterwards.
pub struct HostSpace {
    path: CString,
}

impl HostSpace {
    pub fn new(path: &Path) -> Result<Self, LoaderError> {
        let path =
            CString::new(path.as_os_str().as_bytes()).map_err(|_| LoaderError::InvalidPath(path.to_path_buf()))?;
        Ok(Self { path })
    }
}

impl AddressSpace for HostSpace {
    fn map_fresh(&self, addr: u64, len: usize) -> Result<(), SpaceError> {
        // SAFETY: MAP_FIXED replaces only the requested range, which the caller owns
        // as part of a segment that has not been materialized yet.
        let mapped = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(SpaceError::Map(errno()));
        }
        Ok(())
    }

    fn fill_from_file(&self, addr: u64, file_offset: u64, len: usize) -> Result<usize, SpaceError> {
        if len == 0 {
            return Ok(0);
        }
        // SAFETY: `path` is a valid NUL-terminated string.
        let fd = unsafe { libc::open(self.path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(SpaceError::Open(errno()));
        }
        let result = read_at(fd, addr, file_offset, len);
        // SAFETY: `fd` was opened above and is closed exactly once.
        unsafe { libc::close(fd) };
        result
    }

    fn protect(&self, addr: u64, len: usize, prot: Prot) -> Result<(), SpaceError> {
        // SAFETY: the range was mapped by `map_fresh`.
        let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot_bits(prot)) };
        if rc != 0 {
            return Err(SpaceError::Protect(errno()));
        }
        Ok(())
    }

    fn release(&self, addr: u64, len: usize) -> Result<(), SpaceError> {
        // SAFETY: the range was mapped by `map_fresh` and is not marked present.
        let rc = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
        if rc != 0 {
            return Err(SpaceError::Unmap(errno()));
        }
        Ok(())
    }
}

fn read_at(fd: libc::c_int, addr: u64, file_offset: u64, len: usize) -> Result<usize, SpaceError> {
    let mut done = 0usize;
    while done < len {
        let offset = libc::off_t::try_from(file_offset + done as u64).map_err(|_| SpaceError::Read(libc::EOVERFLOW))?;
        // SAFETY: `[addr, addr + len)` is a writable mapping created by `map_fresh`.
        let n = unsafe { libc::pread(fd, (addr as usize + done) as *mut libc::c_void, len - done, offset) };
        match n {
            0 => break,
            n if n > 0 => done += n as usize,
            _ => {
                let err = errno();
                if err != libc::EINTR {
                    return Err(SpaceError::Read(err));
                }
            }
        }
    }
    Ok(done)
}

/// Translates segment permissions into `PROT_*` bits.
pub fn prot_bits(prot: Prot) -> libc::c_int {
    let mut bits = libc::PROT_NONE;
    if prot.contains(Prot::R) {
        bits |= libc::PROT_READ;
    }
    if prot.contains(Prot::W) {
        bits |= libc::PROT_WRITE;
    }
    if prot.contains(Prot::X) {
        bits |= libc::PROT_EXEC;
    }
    bits
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! `SIGSEGV` entry point and forwarding to the disposition it replaced.

use std::ffi::c_void;
use std::io;
use std::mem;
use std::ptr;

use libc::{c_int, siginfo_t};

use crate::driver;
use crate::resolver::{Disposition, FaultKind};

/// Reads the disposition currently registered for `SIGSEGV`.
pub(crate) fn current_disposition() -> io::Result<libc::sigaction> {
    // SAFETY: a null `act` only queries; `old` is a valid out pointer.
    unsafe {
        let mut old: libc::sigaction = mem::zeroed();
        if libc::sigaction(libc::SIGSEGV, ptr::null(), &mut old) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(old)
    }
}

/// Registers [`on_fault`] for `SIGSEGV` and returns the disposition it replaced.
pub(crate) fn install() -> io::Result<libc::sigaction> {
    swap(libc::SIGSEGV)
}

// Reading and replacing the disposition in one call leaves no window for
// another thread to install a handler in between.
fn swap(signum: c_int) -> io::Result<libc::sigaction> {
    // SAFETY: `action` is fully initialized before being handed to the kernel,
    // `old` is a valid out pointer and `on_fault` has the SA_SIGINFO signature.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = on_fault as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        let mut old: libc::sigaction = mem::zeroed();
        if libc::sigaction(signum, &action, &mut old) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(old)
    }
}

/// Returns true when [`on_fault`] is the registered `SIGSEGV` handler.
pub(crate) fn is_installed() -> bool {
    current_disposition()
        .map(|action| action.sa_sigaction == on_fault as usize)
        .unwrap_or(false)
}

extern "C" fn on_fault(signum: c_int, info: *mut siginfo_t, context: *mut c_void) {
    let Some(runtime) = driver::runtime() else {
        // Fires between install() and publishing the runtime; nothing is
        // attached yet, so the default action applies.
        // SAFETY: a zeroed sigaction is SIG_DFL; `info` comes from the kernel.
        unsafe {
            let default: libc::sigaction = mem::zeroed();
            forward(&default, signum, info, context);
        }
        return;
    };
    // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
    let (addr, code) = unsafe { ((*info).si_addr() as u64, (*info).si_code) };

    match driver::dispatch(addr, FaultKind::from_si_code(code)) {
        Disposition::Resolved { .. } | Disposition::Retry => {}
        // SAFETY: `info` and `context` are forwarded unchanged from the kernel.
        Disposition::Forward(_) => unsafe { forward(&runtime.prior, signum, info, context) },
    }
}

/// Hands the fault to `prior` as if this handler had never been installed.
///
/// A default or ignored disposition is re-armed. A fault raised by an
/// instruction re-executes under it once the handler returns; a signal sent
/// by `kill`, `raise` or `sigqueue` (`si_code <= 0`) would not recur, so it is
/// raised again and delivered when the handler returns.
unsafe fn forward(prior: &libc::sigaction, signum: c_int, info: *mut siginfo_t, context: *mut c_void) {
    let handler = prior.sa_sigaction;
    if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
        libc::sigaction(signum, prior, ptr::null_mut());
        if (*info).si_code <= 0 {
            libc::raise(signum);
        }
        return;
    }
    if prior.sa_flags & libc::SA_SIGINFO != 0 {
        let action: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) = mem::transmute(handler);
        action(signum, info, context);
    } else {
        let action: extern "C" fn(c_int) = mem::transmute(handler);
        action(signum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_returns_replaced_disposition() {
        // SIGUSR2 stands in for SIGSEGV so the test process keeps its own handler.
        let signum = libc::SIGUSR2;
        let first = swap(signum).expect("install");
        assert_eq!(first.sa_sigaction, libc::SIG_DFL);

        let second = swap(signum).expect("reinstall");
        assert_eq!(second.sa_sigaction, on_fault as usize);
        assert_ne!(second.sa_flags & libc::SA_SIGINFO, 0);

        // SAFETY: restores the disposition captured above.
        unsafe { libc::sigaction(signum, &first, ptr::null_mut()) };
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Loader driver: handler installation and program execution
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: tests/demand_paging.rs, tests/fault_forwarding.rs
//!
//! PUBLIC API: initialize(), execute(), execute_with_env(), attach(), image(), is_initialized()
//!
//! Both process-wide records are written once (runtime by `initialize`, image
//! by `attach`) and only read afterwards, including from the fault handler.

use std::convert::Infallible;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use exec_image::LoadPlan;

use crate::handler;
use crate::resolver::{Disposition, FaultKind, FaultResolver, ForwardReason};
use crate::segment::SegmentTable;
use crate::space::HostSpace;
use crate::Error;

/// State captured by [`initialize`].
pub(crate) struct Runtime {
    pub(crate) page_size: usize,
    pub(crate) prior: libc::sigaction,
}

/// The executable whose segments the fault handler serves.
pub struct LoadedImage {
    path: PathBuf,
    plan: LoadPlan,
    table: SegmentTable,
    space: HostSpace,
}

impl LoadedImage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn plan(&self) -> &LoadPlan {
        &self.plan
    }

    pub fn table(&self) -> &SegmentTable {
        &self.table
    }
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static IMAGE: OnceLock<LoadedImage> = OnceLock::new();
static INSTALL: spin::Mutex<()> = spin::Mutex::new(());

pub(crate) fn runtime() -> Option<&'static Runtime> {
    RUNTIME.get()
}

/// Resolves one fault against the attached image, if any.
pub(crate) fn dispatch(addr: u64, kind: FaultKind) -> Disposition {
    match IMAGE.get() {
        Some(image) => FaultResolver::new(&image.table, &image.space).resolve(addr, kind),
        None => Disposition::Forward(ForwardReason::Unmanaged),
    }
}

/// Captures the page size and installs the fault handler, remembering the
/// disposition it replaces.
///
/// Call once per process: a second call returns [`Error::AlreadyInitialized`]
/// and changes nothing. There is no way to uninstall the handler.
pub fn initialize() -> Result<(), Error> {
    let _serialized = INSTALL.lock();
    if RUNTIME.get().is_some() {
        return Err(Error::AlreadyInitialized);
    }
    let page_size = system_page_size()?;
    // Nothing is recorded unless the handler is in place.
    let prior = handler::install().map_err(Error::HandlerInstall)?;
    RUNTIME.set(Runtime { page_size, prior }).map_err(|_| Error::AlreadyInitialized)?;
    log::info!("demand-loader: fault handler installed page_size={page_size}");
    Ok(())
}

/// Returns true once [`initialize`] has installed the handler.
pub fn is_initialized() -> bool {
    RUNTIME.get().is_some() && handler::is_installed()
}

/// Page size captured by [`initialize`].
pub fn page_size() -> Option<usize> {
    RUNTIME.get().map(|runtime| runtime.page_size)
}

/// The image attached by [`attach`] or [`execute`].
pub fn image() -> Option<&'static LoadedImage> {
    IMAGE.get()
}

/// Makes `plan` the image served by the fault handler without launching it.
///
/// Every segment starts with an empty presence record. Only one image can be
/// attached per process.
pub fn attach(path: &Path, plan: LoadPlan) -> Result<&'static LoadedImage, Error> {
    let runtime = RUNTIME.get().ok_or(Error::NotInitialized)?;
    let space = HostSpace::new(path)?;
    let table = SegmentTable::new(&plan, runtime.page_size);
    for seg in table.iter() {
        let plan = seg.plan();
        log::debug!(
            "demand-loader: segment vaddr={:#x} memsz={:#x} filesz={:#x} off={:#x} prot={:?} pages={}",
            plan.vaddr,
            plan.memsz,
            plan.filesz,
            plan.off,
            plan.prot,
            seg.presence().capacity()
        );
    }
    let image = LoadedImage { path: path.to_path_buf(), plan, table, space };
    IMAGE.set(image).map_err(|_| Error::AlreadyAttached)?;
    IMAGE.get().ok_or(Error::AlreadyAttached)
}

/// Parses `path` and runs it with `args` and the current environment.
///
/// Only returns on failure.
pub fn execute<A: AsRef<[u8]>>(path: &Path, args: &[A]) -> Result<Infallible, Error> {
    let env: Vec<Vec<u8>> = std::env::vars_os()
        .map(|(key, value)| {
            let mut entry = key.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            entry
        })
        .collect();
    execute_with_env(path, args, &env)
}

/// Like [`execute`] with an explicit `KEY=VALUE` environment.
pub fn execute_with_env<A, E>(path: &Path, args: &[A], env: &[E]) -> Result<Infallible, Error>
where
    A: AsRef<[u8]>,
    E: AsRef<[u8]>,
{
    let runtime = RUNTIME.get().ok_or(Error::NotInitialized)?;
    let plan = exec_image::parse_exec_file(path, runtime.page_size as u64)
        .map_err(|source| Error::Parse { path: path.to_path_buf(), source })?;
    log::info!(
        "demand-loader: exec {} entry={:#x} segments={}",
        path.display(),
        plan.entry,
        plan.segments.len()
    );

    let image = attach(path, plan)?;
    match exec_image::start::launch(&image.plan, args, env, runtime.page_size as u64) {
        Ok(never) => match never {},
        Err(err) => Err(Error::Launch(err)),
    }
}

fn system_page_size() -> Result<usize, Error> {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|size| size.is_power_of_two()).ok_or(Error::PageSize)
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Demand-paging executable loader
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests per module + 3 integration suites
//!
//! PUBLIC API: initialize(), execute(), execute_with_env(), attach(), FaultResolver, SegmentTable
//! DEPENDS_ON: exec-image (ELF planning, program start)
//!
//! Segments of the loaded executable are never read eagerly. Their address
//! ranges stay unmapped until the program touches them; the `SIGSEGV`
//! handler then maps one page, copies its file bytes, applies the segment's
//! permissions and records the page as present. Faults the loader does not
//! own go to whatever handler was registered before it.

#![deny(clippy::all)]

use std::path::PathBuf;

use thiserror::Error;

pub mod cli;
pub mod config;
mod driver;
mod handler;
pub mod presence;
pub mod resolver;
pub mod segment;
pub mod space;

pub use driver::{attach, execute, execute_with_env, image, initialize, is_initialized, page_size, LoadedImage};
pub use presence::PagePresence;
pub use resolver::{Disposition, FaultKind, FaultResolver, ForwardReason};
pub use segment::{PageWindow, Segment, SegmentTable};
pub use space::{AddressSpace, HostSpace, SpaceError};

/// Errors surfaced by the loader driver.
#[derive(Debug, Error)]
pub enum Error {
    #[error("fault handler already installed")]
    AlreadyInitialized,
    #[error("fault handler not installed; call initialize() first")]
    NotInitialized,
    #[error("failed to install fault handler: {0}")]
    HandlerInstall(#[source] std::io::Error),
    #[error("system page size unavailable")]
    PageSize,
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: exec_image::Error,
    },
    #[error("an executable is already attached")]
    AlreadyAttached,
    #[error("executable path contains a NUL byte: {0}")]
    InvalidPath(PathBuf),
    #[error("program launch failed: {0}")]
    Launch(#[source] exec_image::Error),
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fault resolver: copy-on-fault materialization of segment pages
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests (in-memory address space) + tests/demand_paging.rs
//!
//! INVARIANTS:
//!   - A page is mapped, filled and protected at most once; presence is
//!     recorded only after all three steps succeed, and a page whose fill or
//!     protect failed is unmapped again
//!   - Bytes past the segment's file size read as zero
//!   - Anything the resolver does not own is forwarded, never retried
//!
//! Runs inside the fault handler: no allocation, no logging.

use crate::segment::{Segment, SegmentTable};
use crate::space::{AddressSpace, SpaceError};

const SEGV_MAPERR: i32 = 1;
const SEGV_ACCERR: i32 = 2;

/// Why the kernel reported the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Nothing is mapped at the address.
    Unmapped,
    /// The address is mapped but the access violated its protection.
    ProtectionViolation,
    /// Any other cause (bound or key violations, user-sent signals).
    Other,
}

impl FaultKind {
    /// Classifies a `SIGSEGV` by its `si_code`.
    pub fn from_si_code(code: i32) -> Self {
        match code {
            SEGV_MAPERR => Self::Unmapped,
            SEGV_ACCERR => Self::ProtectionViolation,
            _ => Self::Other,
        }
    }
}

/// Reason a fault is handed to the prior disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardReason {
    ProtectionViolation,
    /// The address lies outside every segment.
    Unmanaged,
    /// The page was materialized before this fault happened.
    AlreadyPresent,
    Unclassified,
    MaterializeFailed(SpaceError),
}

/// Outcome of one fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The page was materialized; the faulting instruction can re-execute.
    Resolved { page: usize },
    /// Another thread materialized the page while this one waited for it.
    Retry,
    Forward(ForwardReason),
}

pub struct FaultResolver<'a, S: AddressSpace> {
    table: &'a SegmentTable,
    space: &'a S,
}

impl<'a, S: AddressSpace> FaultResolver<'a, S> {
    pub fn new(table: &'a SegmentTable, space: &'a S) -> Self {
        Self { table, space }
    }

    pub fn resolve(&self, addr: u64, kind: FaultKind) -> Disposition {
        match kind {
            FaultKind::Unmapped => {}
            FaultKind::ProtectionViolation => return Disposition::Forward(ForwardReason::ProtectionViolation),
            FaultKind::Other => return Disposition::Forward(ForwardReason::Unclassified),
        }
        let Some(segment) = self.table.find(addr) else {
            return Disposition::Forward(ForwardReason::Unmanaged);
        };
        let page_size = self.table.page_size();
        let page = segment.page_index(addr, page_size);
        if segment.presence().contains(page) {
            return Disposition::Forward(ForwardReason::AlreadyPresent);
        }

        let mut pages = segment.presence().claim();
        if pages.contains(page) {
            return Disposition::Retry;
        }
        match self.materialize(segment, page) {
            Ok(()) => {
                pages.mark(page);
                Disposition::Resolved { page }
            }
            Err(err) => Disposition::Forward(ForwardReason::MaterializeFailed(err)),
        }
    }

    fn materialize(&self, segment: &Segment, page: usize) -> Result<(), SpaceError> {
        let page_size = self.table.page_size();
        let window = segment.page_window(page, page_size);
        self.space.map_fresh(window.addr, page_size)?;
        // A short read leaves the rest of the page as mapped: zero.
        let filled = self
            .space
            .fill_from_file(window.addr, window.file_offset, window.file_len)
            .and_then(|_| self.space.protect(window.addr, page_size, segment.plan().prot));
        if filled.is_err() {
            // The forwarded fault must not find a half-built page on re-execution.
            let _ = self.space.release(window.addr, page_size);
        }
        filled
    }
}

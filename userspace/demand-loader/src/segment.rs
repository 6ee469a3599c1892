// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Segment table adapter: parsed segments plus the presence record each one owns.

use exec_image::{LoadPlan, SegmentPlan};

use crate::presence::PagePresence;

/// Where one page of a segment lives and which file bytes back it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    /// Page-aligned virtual address of the page.
    pub addr: u64,
    /// File offset of the first backing byte.
    pub file_offset: u64,
    /// Bytes to copy from the file; the rest of the page stays zero.
    pub file_len: usize,
}

pub struct Segment {
    plan: SegmentPlan,
    presence: PagePresence,
}

impl Segment {
    fn new(plan: SegmentPlan, page_size: usize) -> Self {
        let pages = usize::try_from(plan.memsz).unwrap_or(usize::MAX).div_ceil(page_size);
        Self { plan, presence: PagePresence::new(pages) }
    }

    pub fn plan(&self) -> &SegmentPlan {
        &self.plan
    }

    pub fn presence(&self) -> &PagePresence {
        &self.presence
    }

    /// Returns true when `addr` falls in `[vaddr, vaddr + memsz)`.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.plan.vaddr && addr - self.plan.vaddr < self.plan.memsz
    }

    /// Index of the page holding `addr`; `addr` must lie inside the segment.
    pub fn page_index(&self, addr: u64, page_size: usize) -> usize {
        ((addr - self.plan.vaddr) / page_size as u64) as usize
    }

    /// Computes the mapping target and file range for `page`.
    pub fn page_window(&self, page: usize, page_size: usize) -> PageWindow {
        let page_offset = page as u64 * page_size as u64;
        let file_len = self.plan.filesz.saturating_sub(page_offset).min(page_size as u64) as usize;
        PageWindow {
            addr: self.plan.vaddr + page_offset,
            file_offset: self.plan.off + page_offset,
            file_len,
        }
    }
}

/// Segments of the attached executable, in parser order.
pub struct SegmentTable {
    segments: Box<[Segment]>,
    page_size: usize,
}

impl SegmentTable {
    /// Builds the table and attaches an empty presence record to every segment.
    pub fn new(plan: &LoadPlan, page_size: usize) -> Self {
        let segments = plan
            .segments
            .iter()
            .cloned()
            .map(|seg| Segment::new(seg, page_size))
            .collect();
        Self { segments, page_size }
    }

    /// Finds the segment whose range contains `addr`.
    pub fn find(&self, addr: u64) -> Option<&Segment> {
        self.segments.iter().find(|seg| seg.contains(addr))
    }

    pub fn get(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

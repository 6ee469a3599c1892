// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-segment record of pages that have already been materialized.
//!
//! Storage is sized when the segment table is built, so marking a page from
//! the fault handler never allocates.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

const WORD_BITS: usize = u64::BITS as usize;

fn bit(page: usize) -> u64 {
    1 << (page % WORD_BITS)
}

/// Presence record owned by exactly one segment.
///
/// Lookups read the bitmap without locking; marks happen under the segment
/// lock so a page is materialized by one thread only.
pub struct PagePresence {
    words: Box<[AtomicU64]>,
    capacity: usize,
    lock: Mutex<()>,
}

impl PagePresence {
    /// Creates an empty record for a segment spanning `capacity` pages.
    pub fn new(capacity: usize) -> Self {
        let words = (0..capacity.div_ceil(WORD_BITS)).map(|_| AtomicU64::new(0)).collect();
        Self { words, capacity, lock: Mutex::new(()) }
    }

    /// Returns true when `page` has been marked.
    pub fn contains(&self, page: usize) -> bool {
        page < self.capacity && self.words[page / WORD_BITS].load(Ordering::Acquire) & bit(page) != 0
    }

    /// Marks `page` present. Marking twice is a no-op.
    pub fn mark(&self, page: usize) {
        self.claim().mark(page);
    }

    /// Number of pages marked so far.
    pub fn count(&self) -> usize {
        self.words.iter().map(|word| word.load(Ordering::Acquire).count_ones() as usize).sum()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Holds the segment lock for the duration of a materialization.
    pub(crate) fn claim(&self) -> Claim<'_> {
        Claim { presence: self, _guard: self.lock.lock() }
    }

    fn set(&self, page: usize) {
        debug_assert!(page < self.capacity, "page {page} outside segment");
        if page < self.capacity {
            self.words[page / WORD_BITS].fetch_or(bit(page), Ordering::Release);
        }
    }
}

/// Exclusive access to a segment's presence record.
pub(crate) struct Claim<'a> {
    presence: &'a PagePresence,
    _guard: MutexGuard<'a, ()>,
}

impl Claim<'_> {
    pub(crate) fn contains(&self, page: usize) -> bool {
        self.presence.contains(page)
    }

    /// Indices past the segment are ignored.
    pub(crate) fn mark(&mut self, page: usize) {
        self.presence.set(page);
    }
}

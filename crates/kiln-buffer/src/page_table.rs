//! Page table mapping page numbers to frames.
//!
//! The table itself is not synchronized; the pool keeps it inside its state
//! mutex together with the free list so that lookup, miss handling and
//! eviction are one critical section.

use crate::frame::FrameId;
use kiln_common::page::Pgno;
use std::collections::HashMap;

/// Mapping from resident page numbers to the frames holding them.
#[derive(Debug, Default)]
pub struct PageTable {
    entries: HashMap<Pgno, FrameId>,
}

impl PageTable {
    /// Creates a page table sized for the given number of frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Looks up the frame holding a page.
    #[inline]
    pub fn get(&self, pgno: Pgno) -> Option<FrameId> {
        self.entries.get(&pgno).copied()
    }

    /// Records that a page now lives in a frame.
    ///
    /// Returns the frame previously mapped to the page, if any.
    pub fn insert(&mut self, pgno: Pgno, frame_id: FrameId) -> Option<FrameId> {
        self.entries.insert(pgno, frame_id)
    }

    /// Removes a page from the table.
    pub fn remove(&mut self, pgno: Pgno) -> Option<FrameId> {
        self.entries.remove(&pgno)
    }

    /// Returns true if the page is resident.
    pub fn contains(&self, pgno: Pgno) -> bool {
        self.entries.contains_key(&pgno)
    }

    /// Number of resident pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates over resident (page, frame) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Pgno, FrameId)> + '_ {
        self.entries.iter().map(|(&pgno, &fid)| (pgno, fid))
    }
}

//! Positional cursors.
//!
//! A cursor walks the records of a heap in page then slot order. Only
//! record starts are visible: whole fragments and the first fragment of a
//! split record. While positioned the cursor keeps its page pinned and
//! holds one lock count on it under its own locker; moving acquires the
//! new page before the old one is released. A move that finds nothing
//! leaves the cursor where it was.

use super::constants::FIRST_REGION_PGNO;
use super::file::HeapFile;
use super::meta::MetaPage;
use super::page::DataPage;
use super::read::{ReadRange, ReadTarget};
use super::rid::Rid;
use super::split::NewImage;
use crate::lock::{LockMode, LockerId, OpLocks};
use kiln_buffer::PageGuard;
use kiln_common::page::{Pgno, META_PGNO};
use kiln_common::{KilnError, Result};

const FIRST_DATA_PGNO: Pgno = FIRST_REGION_PGNO + 1;

/// Cursor over the records of a `HeapFile`.
pub struct Cursor<'a> {
    heap: &'a HeapFile,
    locker: LockerId,
    mode: LockMode,
    pos: Option<Rid>,
    page: Option<PageGuard<'a>>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(heap: &'a HeapFile, locker: LockerId, mode: LockMode) -> Self {
        Self {
            heap,
            locker,
            mode,
            pos: None,
            page: None,
        }
    }

    /// Record the cursor is on, if any.
    pub fn position(&self) -> Option<Rid> {
        self.pos
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn locker(&self) -> LockerId {
        self.locker
    }

    /// Moves to the first record.
    pub fn first(&mut self) -> Result<Option<Rid>> {
        let heap = self.heap;
        heap.read_op(|| self.scan_forward(FIRST_DATA_PGNO, 0))
    }

    /// Moves to the last record.
    pub fn last(&mut self) -> Result<Option<Rid>> {
        let heap = self.heap;
        heap.read_op(|| {
            let last = self.stored_last_pgno()?;
            self.scan_backward(last, u32::MAX)
        })
    }

    /// Moves to the next record, or to the first one when unpositioned.
    pub fn next(&mut self) -> Result<Option<Rid>> {
        let heap = self.heap;
        heap.read_op(|| match self.pos {
            None => self.scan_forward(FIRST_DATA_PGNO, 0),
            Some(rid) => self.scan_forward(rid.pgno, rid.slot + 1),
        })
    }

    /// Moves to the previous record, or to the last one when unpositioned.
    pub fn prev(&mut self) -> Result<Option<Rid>> {
        let heap = self.heap;
        heap.read_op(|| match self.pos {
            None => {
                let last = self.stored_last_pgno()?;
                self.scan_backward(last, u32::MAX)
            }
            Some(rid) if rid.slot > 0 => self.scan_backward(rid.pgno, rid.slot - 1),
            Some(rid) if rid.pgno > FIRST_DATA_PGNO => self.scan_backward(rid.pgno - 1, u32::MAX),
            Some(_) => Ok(None),
        })
    }

    /// Moves to the record at `rid`.
    pub fn set(&mut self, rid: Rid) -> Result<()> {
        let heap = self.heap;
        heap.read_op(|| self.seek(rid, None))
    }

    /// Moves to the record at `rid` only if it holds exactly `data`.
    pub fn set_exact(&mut self, rid: Rid, data: &[u8]) -> Result<()> {
        let heap = self.heap;
        heap.read_op(|| self.seek(rid, Some(data)))
    }

    /// Returns the current record, or None when unpositioned.
    pub fn current(&mut self) -> Result<Option<(Rid, Vec<u8>)>> {
        let Some(rid) = self.pos else {
            return Ok(None);
        };
        let mut out = Vec::new();
        self.get(ReadRange::ALL, ReadTarget::Alloc(&mut out))?;
        Ok(Some((rid, out)))
    }

    /// Reads part of the current record.
    pub fn get(&mut self, range: ReadRange, target: ReadTarget<'_>) -> Result<usize> {
        let rid = self.positioned()?;
        let heap = self.heap;
        heap.read_op(|| {
            let mut locks = OpLocks::new(&heap.locks, self.locker);
            heap.read_record(&mut locks, rid, range, target, self.mode)
        })
    }

    /// Replaces the current record's contents.
    pub fn put(&mut self, data: &[u8]) -> Result<()> {
        let rid = self.positioned()?;
        let heap = self.heap;
        heap.write_op(Some(self.locker), |ctx| {
            heap.relocate(ctx, rid, NewImage::Whole(data))
        })
    }

    /// Overwrites a byte range of the current record.
    pub fn put_range(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let rid = self.positioned()?;
        let heap = self.heap;
        heap.write_op(Some(self.locker), |ctx| {
            heap.relocate(ctx, rid, NewImage::Range { offset, data })
        })
    }

    /// Deletes the current record. The cursor stays on its slot, so `next`
    /// and `prev` continue from there.
    pub fn delete(&mut self) -> Result<()> {
        let rid = self.positioned()?;
        let heap = self.heap;
        heap.write_op(Some(self.locker), |ctx| heap.delete_in(ctx, rid))
    }

    /// Drops the position and its lock.
    pub fn reset(&mut self) {
        self.page = None;
        if let Some(rid) = self.pos.take() {
            self.heap.locks.release(self.locker, rid.pgno);
        }
    }

    fn positioned(&self) -> Result<Rid> {
        self.pos
            .ok_or_else(|| KilnError::InvalidArgument("cursor is not positioned".to_string()))
    }

    /// Highest allocated page, read from the metadata page.
    fn stored_last_pgno(&self) -> Result<Pgno> {
        let heap = self.heap;
        heap.locks.acquire(self.locker, META_PGNO, LockMode::Read, true)?;
        let last = heap
            .fetch(META_PGNO)
            .map(|guard| MetaPage::last_pgno(&guard.read()));
        heap.locks.release(self.locker, META_PGNO);
        last
    }

    fn scan_forward(&mut self, mut pgno: Pgno, mut slot: u32) -> Result<Option<Rid>> {
        let last = self.heap.last_pgno();
        while pgno <= last {
            if self.heap.geometry.is_data_pgno(pgno) {
                let from = slot;
                if let Some(rid) = self.probe(pgno, |buf| DataPage::next_visible(buf, from))? {
                    return Ok(Some(rid));
                }
            }
            let Some(next) = pgno.checked_add(1) else {
                break;
            };
            pgno = next;
            slot = 0;
        }
        Ok(None)
    }

    fn scan_backward(&mut self, mut pgno: Pgno, mut slot: u32) -> Result<Option<Rid>> {
        while pgno >= FIRST_DATA_PGNO {
            if self.heap.geometry.is_data_pgno(pgno) {
                let from = slot;
                if let Some(rid) = self.probe(pgno, |buf| DataPage::prev_visible(buf, from))? {
                    return Ok(Some(rid));
                }
            }
            pgno -= 1;
            slot = u32::MAX;
        }
        Ok(None)
    }

    /// Locks `pgno` and looks for a record on it with `find`. Moves there on
    /// a hit; otherwise the lock is given back.
    fn probe(
        &mut self,
        pgno: Pgno,
        find: impl FnOnce(&[u8]) -> Result<Option<u16>>,
    ) -> Result<Option<Rid>> {
        let heap: &'a HeapFile = self.heap;
        heap.locks.acquire(self.locker, pgno, self.mode, true)?;
        let found = heap.fetch(pgno).and_then(|guard| {
            let slot = {
                let buf = guard.read();
                if !DataPage::is_data(&buf) || DataPage::entries(&buf) == 0 {
                    None
                } else {
                    find(&buf[..])?
                }
            };
            Ok(slot.map(|slot| (guard, slot)))
        });
        match found {
            Ok(Some((guard, slot))) => {
                let rid = Rid::new(pgno, slot as u32);
                self.settle(rid, guard);
                Ok(Some(rid))
            }
            Ok(None) => {
                heap.locks.release(self.locker, pgno);
                Ok(None)
            }
            Err(err) => {
                heap.locks.release(self.locker, pgno);
                Err(err)
            }
        }
    }

    fn seek(&mut self, rid: Rid, expected: Option<&[u8]>) -> Result<()> {
        let heap: &'a HeapFile = self.heap;
        let slot = heap.check_rid(rid)?;
        heap.locks.acquire(self.locker, rid.pgno, self.mode, true)?;
        match self.check_target(rid, slot, expected) {
            Ok(guard) => {
                self.settle(rid, guard);
                Ok(())
            }
            Err(err) => {
                heap.locks.release(self.locker, rid.pgno);
                Err(err)
            }
        }
    }

    fn check_target(&self, rid: Rid, slot: u16, expected: Option<&[u8]>) -> Result<PageGuard<'a>> {
        let heap: &'a HeapFile = self.heap;
        let guard = heap.fetch(rid.pgno)?;
        let len = {
            let buf = guard.read();
            if !DataPage::is_data(&buf) {
                return Err(KilnError::NotFound);
            }
            match DataPage::fragment(&buf, slot)? {
                Some((header, _)) if header.is_visible() => header.record_len(),
                _ => return Err(KilnError::NotFound),
            }
        };

        if let Some(expected) = expected {
            if len != expected.len() {
                return Err(KilnError::NotFound);
            }
            let mut locks = OpLocks::new(&heap.locks, self.locker);
            let mut stored = Vec::new();
            heap.read_record(
                &mut locks,
                rid,
                ReadRange::ALL,
                ReadTarget::Alloc(&mut stored),
                self.mode,
            )?;
            if stored != expected {
                return Err(KilnError::NotFound);
            }
        }
        Ok(guard)
    }

    /// Takes up `rid`. The caller already holds a fresh lock count on its
    /// page; the count on the old position is given back.
    fn settle(&mut self, rid: Rid, guard: PageGuard<'a>) {
        if let Some(old) = self.pos.replace(rid) {
            self.heap.locks.release(self.locker, old.pgno);
        }
        self.page = Some(guard);
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        self.page = None;
        self.heap.locks.release_all(self.locker);
    }
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("locker", &self.locker)
            .field("mode", &self.mode)
            .field("pos", &self.pos)
            .finish()
    }
}

//! Data page allocation.
//!
//! A request for `n` free bytes searches region bitmaps starting where the
//! previous allocation left off. The first lap never blocks: busy region
//! latches and locked pages are skipped. If that finds nothing, a second
//! lap repeats the search waiting on latches and locks. Within a region,
//! used pages whose level admits the request are tried before a new page
//! past the region's high-water mark is claimed.
//!
//! A region latch is only held while reading candidates or raising the
//! high-water mark, and nothing is waited on while it is held.

use super::constants::{max_fragment_size, SLOT_SIZE};
use super::file::{HeapFile, OpCtx};
use super::meta::MetaPage;
use super::page::DataPage;
use super::region::RegionPage;
use crate::lock::LockMode;
use kiln_buffer::PageGuard;
use kiln_common::page::{PageHeader, PageType, Pgno, META_PGNO};
use kiln_common::{KilnError, Result};
use kiln_wal::HeapLogRecord;
use tracing::{debug, info, warn};

/// Where the next allocation search starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AllocCursor {
    pub region: u32,
    /// Data page index within the region.
    pub position: u32,
}

/// A write-locked data page with room for the request.
pub(crate) struct Allocation<'a> {
    pub guard: PageGuard<'a>,
    /// Bitmap level of the page when it was granted.
    pub level: u8,
}

impl Allocation<'_> {
    pub fn pgno(&self) -> Pgno {
        self.guard.pgno()
    }
}

impl HeapFile {
    /// Finds a data page with at least `need` free bytes and write-locks it
    /// for the operation.
    pub(crate) fn allocate(&self, ctx: &mut OpCtx<'_>, need: usize) -> Result<Allocation<'_>> {
        let largest = max_fragment_size(self.geometry.page_size()) + SLOT_SIZE;
        if need > largest {
            return Err(KilnError::Internal(format!(
                "allocation of {} bytes exceeds one page ({})",
                need, largest
            )));
        }
        let level = self.geometry.level_of(need);
        let start = *self.alloc_cursor.lock();

        for wait in [false, true] {
            let mut region = start.region;
            loop {
                if let Some(found) = self.search_region(ctx, region, need, level, wait)? {
                    return Ok(found);
                }
                match self.geometry.next_region(region) {
                    Some(next) if next != start.region => region = next,
                    _ => break,
                }
            }
            if !wait {
                debug!(need, "no page granted without waiting, searching again");
            }
        }

        warn!(need, max_pages = ?self.geometry.max_pages(), "heap full");
        Err(KilnError::HeapFull)
    }

    fn search_region(
        &self,
        ctx: &mut OpCtx<'_>,
        region: u32,
        need: usize,
        level: u8,
        wait: bool,
    ) -> Result<Option<Allocation<'_>>> {
        let Some(rpgno) = self.geometry.region_pgno(region) else {
            return Ok(None);
        };
        let Some(first) = rpgno.checked_add(1) else {
            return Ok(None);
        };
        if self.geometry.exceeds_limit(first) {
            return Ok(None);
        }
        if rpgno > self.last_pgno() && !self.create_region(ctx, region, rpgno)? {
            return Ok(None);
        }

        let cursor = *self.alloc_cursor.lock();
        let rguard = self.fetch(rpgno)?;
        let candidates: Vec<Pgno> = {
            let mut buf = if wait {
                rguard.latch()
            } else {
                match rguard.try_latch() {
                    Some(buf) => buf,
                    None => return Ok(None),
                }
            };
            if !RegionPage::is_region(&buf) {
                warn!(region, pgno = rpgno, "region page was never formatted, formatting");
                RegionPage::init(&mut buf, rpgno);
                rguard.mark_dirty();
            }
            let high = RegionPage::high(&buf);
            let used = if high == 0 { 0 } else { high - rpgno };
            let start = if cursor.region == region && cursor.position < used {
                cursor.position
            } else {
                0
            };
            (0..used)
                .map(|k| (start + k) % used)
                .filter(|&index| RegionPage::level(&buf, index) <= level)
                .map(|index| first + index)
                .collect()
        };

        for pgno in candidates {
            if let Some(found) = self.try_candidate(ctx, pgno, need, wait)? {
                self.move_cursor(region, rpgno, pgno);
                return Ok(Some(found));
            }
        }
        self.claim_page(ctx, region, rpgno, &rguard, wait)
    }

    /// Locks a candidate page and checks its real free space.
    fn try_candidate(
        &self,
        ctx: &mut OpCtx<'_>,
        pgno: Pgno,
        need: usize,
        wait: bool,
    ) -> Result<Option<Allocation<'_>>> {
        match ctx.locks.acquire(pgno, LockMode::Write, wait) {
            Ok(()) => {}
            Err(err) if err.is_lock_contention() => return Ok(None),
            Err(err) => return Err(err),
        }
        let guard = self.fetch(pgno)?;
        let free = {
            let mut buf = guard.latch();
            if !DataPage::is_data(&buf) {
                DataPage::init(&mut buf, pgno);
                guard.mark_dirty();
            }
            DataPage::free_space(&buf)
        };
        if free >= need {
            return Ok(Some(Allocation {
                guard,
                level: self.geometry.level_of(free),
            }));
        }
        drop(guard);
        ctx.locks.release(pgno);
        Ok(None)
    }

    /// Claims the page after the region's high-water mark.
    fn claim_page<'a>(
        &'a self,
        ctx: &mut OpCtx<'_>,
        region: u32,
        rpgno: Pgno,
        rguard: &PageGuard<'a>,
        wait: bool,
    ) -> Result<Option<Allocation<'a>>> {
        let pgno = {
            let mut buf = if wait {
                rguard.latch()
            } else {
                match rguard.try_latch() {
                    Some(buf) => buf,
                    None => return Ok(None),
                }
            };
            let high = RegionPage::high(&buf);
            let Some(next) = (if high == 0 { rpgno } else { high }).checked_add(1) else {
                return Ok(None);
            };
            if next - rpgno > self.geometry.region_size() || self.geometry.exceeds_limit(next) {
                return Ok(None);
            }
            // the high-water mark moves before the latch drops, so the page
            // must be locked without waiting
            match ctx.locks.acquire(next, LockMode::Write, false) {
                Ok(()) => {}
                Err(err) if err.is_lock_contention() => return Ok(None),
                Err(err) => return Err(err),
            }
            RegionPage::set_high(&mut buf, next);
            rguard.mark_dirty();
            next
        };

        self.record_page_alloc(ctx, pgno, PageType::Data)?;
        let guard = self.fetch(pgno)?;
        {
            let mut buf = guard.latch();
            DataPage::init(&mut buf, pgno);
            guard.mark_dirty();
        }
        self.move_cursor(region, rpgno, pgno);
        debug!(pgno, region, "claimed data page");
        Ok(Some(Allocation { guard, level: 0 }))
    }

    /// Creates region `region` if no one has yet. Returns false when the
    /// region cannot exist.
    fn create_region(&self, ctx: &mut OpCtx<'_>, region: u32, rpgno: Pgno) -> Result<bool> {
        if self.geometry.exceeds_limit(rpgno) {
            return Ok(false);
        }
        ctx.locks.acquire(META_PGNO, LockMode::Write, true)?;
        let result = self.create_region_locked(ctx, region, rpgno);
        ctx.locks.release(META_PGNO);
        result.map(|_| true)
    }

    fn create_region_locked(&self, ctx: &mut OpCtx<'_>, region: u32, rpgno: Pgno) -> Result<()> {
        {
            let guard = self.fetch(META_PGNO)?;
            let mut buf = guard.write();
            let prev_last = MetaPage::last_pgno(&buf);
            if rpgno <= prev_last {
                return Ok(());
            }
            let record = HeapLogRecord::PageAlloc {
                pgno: rpgno,
                page_type: PageType::Region as u8,
                prev_last,
                new_last: rpgno,
            };
            let lsn = self.log.append(ctx.txn(), ctx.prev_lsn(), &record)?;
            MetaPage::set_last_pgno(&mut buf, rpgno);
            if lsn.is_valid() {
                PageHeader::set_lsn(&mut buf, lsn.0);
            }
            ctx.note_logged(lsn);
        }

        let rguard = self.fetch(rpgno)?;
        {
            let mut buf = rguard.latch();
            RegionPage::init(&mut buf, rpgno);
            rguard.mark_dirty();
        }
        self.raise_last_pgno(rpgno);
        info!(region, pgno = rpgno, "created region");
        Ok(())
    }

    /// Raises the meta page's last page number to `pgno` if it is lower.
    pub(crate) fn record_page_alloc(
        &self,
        ctx: &mut OpCtx<'_>,
        pgno: Pgno,
        page_type: PageType,
    ) -> Result<()> {
        if pgno <= self.last_pgno() {
            return Ok(());
        }
        ctx.locks.acquire(META_PGNO, LockMode::Write, true)?;
        let result = self.record_page_alloc_locked(ctx, pgno, page_type);
        ctx.locks.release(META_PGNO);
        result
    }

    fn record_page_alloc_locked(
        &self,
        ctx: &mut OpCtx<'_>,
        pgno: Pgno,
        page_type: PageType,
    ) -> Result<()> {
        let guard = self.fetch(META_PGNO)?;
        let mut buf = guard.write();
        let prev_last = MetaPage::last_pgno(&buf);
        if pgno <= prev_last {
            return Ok(());
        }
        let record = HeapLogRecord::PageAlloc {
            pgno,
            page_type: page_type as u8,
            prev_last,
            new_last: pgno,
        };
        let lsn = self.log.append(ctx.txn(), ctx.prev_lsn(), &record)?;
        MetaPage::set_last_pgno(&mut buf, pgno);
        if lsn.is_valid() {
            PageHeader::set_lsn(&mut buf, lsn.0);
        }
        ctx.note_logged(lsn);
        self.raise_last_pgno(pgno);
        Ok(())
    }

    fn move_cursor(&self, region: u32, rpgno: Pgno, pgno: Pgno) {
        *self.alloc_cursor.lock() = AllocCursor {
            region,
            position: pgno - rpgno - 1,
        };
    }
}

#[cfg(test)]
mod tests {
    use crate::heap::file::{HeapFile, HeapFileConfig};
    use crate::heap::region::RegionPage;
    use crate::heap::rid::Rid;
    use kiln_common::KilnError;
    use std::time::{Duration, Instant};

    fn create_test_heap(region_size: u32, max_pages: Option<u32>) -> HeapFile {
        HeapFile::in_memory(HeapFileConfig {
            page_size: 512,
            region_size: Some(region_size),
            max_pages,
            buffer_pool_pages: 32,
            ..Default::default()
        })
        .unwrap()
    }

    fn region_high(heap: &HeapFile, region: u32) -> u32 {
        let guard = heap.fetch(heap.geometry.region_pgno(region).unwrap()).unwrap();
        let buf = guard.read();
        RegionPage::high(&buf)
    }

    #[test]
    fn test_small_records_share_a_page() {
        let heap = create_test_heap(4, None);
        let a = heap.append(b"first").unwrap();
        let b = heap.append(b"second").unwrap();
        assert_eq!(a, Rid::new(2, 0));
        assert_eq!(b, Rid::new(2, 1));
        assert_eq!(region_high(&heap, 0), 2);
    }

    #[test]
    fn test_full_region_moves_to_next() {
        let heap = create_test_heap(2, None);
        // one 400 byte record fills a 512 byte page
        let rids: Vec<Rid> = (0..3).map(|_| heap.append(&[1u8; 400]).unwrap()).collect();
        assert_eq!(rids[0].pgno, 2);
        assert_eq!(rids[1].pgno, 3);
        // region 1 has its bitmap at page 4
        assert_eq!(rids[2].pgno, 5);
        assert_eq!(region_high(&heap, 0), 3);
        assert_eq!(region_high(&heap, 1), 5);
        assert_eq!(heap.stats().last_pgno, 5);
    }

    #[test]
    fn test_max_pages_reports_heap_full() {
        let heap = create_test_heap(2, Some(7));
        let rids: Vec<Rid> = (0..4).map(|_| heap.append(&[2u8; 400]).unwrap()).collect();
        assert_eq!(
            rids.iter().map(|r| r.pgno).collect::<Vec<_>>(),
            vec![2, 3, 5, 6]
        );
        assert!(matches!(heap.append(&[3u8; 400]), Err(KilnError::HeapFull)));
        // small records still fit in the leftover space
        assert!(heap.append(b"tiny").is_ok());

        // freed space is found again after wrapping to region 0
        heap.delete(rids[1]).unwrap();
        let again = heap.append(&[4u8; 400]).unwrap();
        assert_eq!(again.pgno, 3);
        assert!(heap.stats().last_pgno < 7);
    }

    fn create_contended_heap(max_pages: Option<u32>) -> HeapFile {
        HeapFile::in_memory(HeapFileConfig {
            page_size: 512,
            region_size: Some(4),
            max_pages,
            buffer_pool_pages: 32,
            lock_timeout: Some(Duration::from_millis(300)),
        })
        .unwrap()
    }

    #[test]
    fn test_locked_candidate_is_skipped() {
        let heap = create_contended_heap(None);
        let held = heap.append(b"held").unwrap();
        let mut cursor = heap.cursor_rmw();
        cursor.set(held).unwrap();

        // page 2 has room but is write locked; the first lap moves on
        let started = Instant::now();
        let rid = heap.append(b"other").unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(rid, Rid::new(3, 0));
        assert_eq!(cursor.position(), Some(held));

        drop(cursor);
        heap.append(b"after").unwrap();
        assert_eq!(heap.stats().locked_pages, 0);
    }

    #[test]
    fn test_locked_only_page_reports_heap_full() {
        // meta, region and a single data page
        let heap = create_contended_heap(Some(3));
        let held = heap.append(b"held").unwrap();
        let mut cursor = heap.cursor_rmw();
        cursor.set(held).unwrap();

        assert!(matches!(heap.append(b"other"), Err(KilnError::HeapFull)));
        assert!(!heap.is_failed());
        drop(cursor);
        assert_eq!(heap.append(b"other").unwrap(), Rid::new(2, 1));
    }

    #[test]
    fn test_freed_page_level_is_reused() {
        let heap = create_test_heap(4, None);
        let big = heap.append(&[9u8; 400]).unwrap();
        let other = heap.append(&[8u8; 400]).unwrap();
        assert_ne!(big.pgno, other.pgno);
        heap.delete(big).unwrap();
        let next = heap.append(&[7u8; 400]).unwrap();
        assert_eq!(next.pgno, big.pgno);
    }
}

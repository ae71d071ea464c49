//! Buffer pool manager.

use crate::frame::{BufferFrame, FrameId};
use crate::page_table::PageTable;
use crate::replacer::{ClockReplacer, Replacer};
use crate::store::PageStore;
use kiln_common::page::{PageHeader, Pgno};
use kiln_common::{KilnError, Result};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use tracing::trace;

/// Called with a page's LSN before the page is written back, so the log can
/// be made durable up to that point first.
pub type WalBarrier = Arc<dyn Fn(u64) -> Result<()> + Send + Sync>;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { num_frames: 1024 }
    }
}

/// How `fetch` treats a page the store has never seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// The page must exist; otherwise `PageNotFound`.
    Existing,
    /// A missing page is materialized as a zeroed frame.
    Create,
}

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with:
/// - Page table and free list guarded by one state mutex
/// - Clock replacement for eviction
/// - Pin counting so pinned frames are never evicted
/// - Dirty page write-back through the backing `PageStore`
pub struct BufferPool {
    /// Configuration.
    config: BufferPoolConfig,
    /// Array of buffer frames.
    frames: Vec<BufferFrame>,
    /// Page table and free frames.
    state: Mutex<PoolState>,
    /// Page replacement policy.
    replacer: ClockReplacer,
    /// Where pages come from and go to.
    store: Arc<dyn PageStore>,
    /// Log durability hook run before every write-back.
    wal_barrier: RwLock<Option<WalBarrier>>,
}

struct PoolState {
    page_table: PageTable,
    free_list: Vec<FrameId>,
}

impl BufferPool {
    /// Creates a new buffer pool over a backing store.
    pub fn new(config: BufferPoolConfig, store: Arc<dyn PageStore>) -> Self {
        let num_frames = config.num_frames;
        let page_size = store.page_size();

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32), page_size))
            .collect();

        // Pop order hands out frame 0 first
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            config,
            frames,
            state: Mutex::new(PoolState {
                page_table: PageTable::new(num_frames),
                free_list,
            }),
            replacer: ClockReplacer::new(num_frames),
            store,
            wal_barrier: RwLock::new(None),
        }
    }

    /// Installs the hook that makes the log durable before write-back.
    pub fn set_wal_barrier(&self, barrier: WalBarrier) {
        *self.wal_barrier.write() = Some(barrier);
    }

    /// Returns the page size of every frame.
    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }

    /// Returns the backing store.
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Returns the number of pages currently in the pool.
    pub fn page_count(&self) -> usize {
        self.state.lock().page_table.len()
    }

    /// Checks if a page is in the buffer pool.
    pub fn contains(&self, pgno: Pgno) -> bool {
        self.state.lock().page_table.contains(pgno)
    }

    /// Pins a page, loading it from the store on a miss.
    ///
    /// The returned guard unpins the page when dropped.
    pub fn fetch(&self, pgno: Pgno, mode: FetchMode) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock();

        if let Some(frame_id) = state.page_table.get(pgno) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.record_access(frame_id);
            return Ok(PageGuard { frame, pgno });
        }

        let frame_id = self.allocate_frame(&mut state)?;
        let frame = &self.frames[frame_id.0 as usize];

        let loaded = {
            let mut data = frame.write_data();
            self.store.read_page(pgno, &mut data)
        };
        let exists = match loaded {
            Ok(exists) => exists,
            Err(e) => {
                state.free_list.push(frame_id);
                return Err(e);
            }
        };
        if !exists && mode == FetchMode::Existing {
            state.free_list.push(frame_id);
            return Err(KilnError::PageNotFound { pgno });
        }

        frame.set_pgno(Some(pgno));
        frame.pin();
        state.page_table.insert(pgno, frame_id);
        self.replacer.record_access(frame_id);
        trace!(pgno, frame = %frame_id, created = !exists, "page loaded");

        Ok(PageGuard { frame, pgno })
    }

    /// Takes a free frame or evicts an unpinned one.
    fn allocate_frame(&self, state: &mut PoolState) -> Result<FrameId> {
        if let Some(frame_id) = state.free_list.pop() {
            return Ok(frame_id);
        }

        let victim_id = self
            .replacer
            .evict(&|fid| {
                let frame = &self.frames[fid.0 as usize];
                frame.pin_count() == 0 && frame.pgno().is_some()
            })
            .ok_or(KilnError::BufferPoolFull)?;

        let frame = &self.frames[victim_id.0 as usize];
        if let Some(old_pgno) = frame.pgno() {
            if frame.is_dirty() {
                let data = frame.read_data();
                self.write_back(frame, old_pgno, &data)?;
            }
            state.page_table.remove(old_pgno);
            trace!(pgno = old_pgno, frame = %victim_id, "page evicted");
        }
        self.replacer.remove(victim_id);
        frame.reset();

        Ok(victim_id)
    }

    /// Writes one frame's bytes to the store after the WAL barrier.
    fn write_back(&self, frame: &BufferFrame, pgno: Pgno, data: &[u8]) -> Result<()> {
        if let Some(barrier) = self.wal_barrier.read().as_ref() {
            barrier(PageHeader::lsn_of(data))?;
        }
        self.store.write_page(pgno, data)?;
        frame.set_dirty(false);
        Ok(())
    }

    /// Writes a resident page back if it is dirty.
    ///
    /// Returns true if the page was written.
    pub fn flush_page(&self, pgno: Pgno) -> Result<bool> {
        let frame = {
            let state = self.state.lock();
            match state.page_table.get(pgno) {
                Some(fid) => {
                    let frame = &self.frames[fid.0 as usize];
                    frame.pin();
                    frame
                }
                None => return Ok(false),
            }
        };

        let result = if frame.is_dirty() {
            let data = frame.read_data();
            self.write_back(frame, pgno, &data).map(|_| true)
        } else {
            Ok(false)
        };
        frame.unpin();
        result
    }

    /// Flushes all dirty pages.
    ///
    /// Returns the number of pages written. Every targeted frame is unpinned
    /// again even if a write fails; the first error is returned.
    pub fn flush_all(&self) -> Result<usize> {
        // Pin the dirty frames so eviction cannot repurpose them while the
        // state mutex is released.
        let targets: Vec<(Pgno, FrameId)> = {
            let state = self.state.lock();
            state
                .page_table
                .iter()
                .filter(|(_, fid)| self.frames[fid.0 as usize].is_dirty())
                .inspect(|(_, fid)| {
                    self.frames[fid.0 as usize].pin();
                })
                .collect()
        };

        let mut flushed = 0;
        let mut flush_error: Option<KilnError> = None;

        for (pgno, frame_id) in targets {
            let frame = &self.frames[frame_id.0 as usize];
            if flush_error.is_none() && frame.is_dirty() {
                let data = frame.read_data();
                match self.write_back(frame, pgno, &data) {
                    Ok(()) => flushed += 1,
                    Err(e) => flush_error = Some(e),
                }
            }
            frame.unpin();
        }

        match flush_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let state = self.state.lock();
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;

        for (_, frame_id) in state.page_table.iter() {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                pinned_frames += 1;
            }
            if frame.is_dirty() {
                dirty_frames += 1;
            }
        }

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: state.free_list.len(),
            used_frames: state.page_table.len(),
            pinned_frames,
            dirty_frames,
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

/// RAII pin on a resident page.
///
/// The pin keeps the frame from being evicted. Access to the bytes goes
/// through the latch methods, which borrow from the guard so no latch can
/// outlive the pin.
pub struct PageGuard<'a> {
    frame: &'a BufferFrame,
    pgno: Pgno,
}

impl<'a> PageGuard<'a> {
    /// Returns the page number.
    pub fn pgno(&self) -> Pgno {
        self.pgno
    }

    /// Shared access to the page bytes.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.frame.read_data()
    }

    /// Exclusive access to the page bytes; the page is marked dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        let data = self.frame.write_data();
        self.frame.set_dirty(true);
        data
    }

    /// Exclusive latch without dirtying the page.
    ///
    /// Call `mark_dirty` while the latch is held if the bytes change.
    pub fn latch(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.frame.write_data()
    }

    /// Exclusive latch if it is immediately available.
    pub fn try_latch(&self) -> Option<RwLockWriteGuard<'_, Box<[u8]>>> {
        self.frame.try_write_data()
    }

    /// Marks the page as dirty.
    pub fn mark_dirty(&self) {
        self.frame.set_dirty(true);
    }

    /// Returns true if the page has unwritten changes.
    pub fn is_dirty(&self) -> bool {
        self.frame.is_dirty()
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.frame.unpin();
    }
}

impl std::fmt::Debug for PageGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("pgno", &self.pgno)
            .field("frame", &self.frame.frame_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPageStore;
    use std::sync::atomic::{AtomicU64, Ordering};

    const PAGE: usize = 512;

    fn create_test_pool(num_frames: usize) -> (BufferPool, Arc<MemoryPageStore>) {
        let store = Arc::new(MemoryPageStore::new(PAGE));
        let pool = BufferPool::new(BufferPoolConfig { num_frames }, store.clone());
        (pool, store)
    }

    #[test]
    fn test_buffer_pool_new() {
        let (pool, _) = create_test_pool(10);

        assert_eq!(pool.num_frames(), 10);
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.page_count(), 0);
        assert_eq!(pool.page_size(), PAGE);
    }

    #[test]
    fn test_fetch_existing_missing_page() {
        let (pool, _) = create_test_pool(4);

        let result = pool.fetch(3, FetchMode::Existing);
        assert!(matches!(result, Err(KilnError::PageNotFound { pgno: 3 })));
        // the frame went back to the free list
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_fetch_create_zeroed() {
        let (pool, _) = create_test_pool(4);

        let guard = pool.fetch(3, FetchMode::Create).unwrap();
        assert_eq!(guard.pgno(), 3);
        assert!(guard.read().iter().all(|&b| b == 0));
        assert!(!guard.is_dirty());
        assert!(pool.contains(3));
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn test_fetch_hit_shares_frame() {
        let (pool, _) = create_test_pool(4);

        let g1 = pool.fetch(1, FetchMode::Create).unwrap();
        g1.write()[0] = 0x5A;
        let g2 = pool.fetch(1, FetchMode::Existing).unwrap();
        assert_eq!(g2.read()[0], 0x5A);
        assert_eq!(pool.stats().pinned_frames, 1);
        drop(g1);
        drop(g2);
        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_write_marks_dirty_latch_does_not() {
        let (pool, _) = create_test_pool(4);
        let guard = pool.fetch(1, FetchMode::Create).unwrap();

        drop(guard.latch());
        assert!(!guard.is_dirty());

        drop(guard.write());
        assert!(guard.is_dirty());
    }

    #[test]
    fn test_try_latch_contended() {
        let (pool, _) = create_test_pool(4);
        let g1 = pool.fetch(1, FetchMode::Create).unwrap();
        let g2 = pool.fetch(1, FetchMode::Existing).unwrap();

        let held = g1.latch();
        assert!(g2.try_latch().is_none());
        drop(held);
        assert!(g2.try_latch().is_some());
    }

    #[test]
    fn test_eviction_writes_back_dirty_page() {
        let (pool, store) = create_test_pool(2);

        {
            let guard = pool.fetch(1, FetchMode::Create).unwrap();
            guard.write()[100] = 0xCD;
        }
        // fill the pool so page 1 gets evicted
        drop(pool.fetch(2, FetchMode::Create).unwrap());
        drop(pool.fetch(3, FetchMode::Create).unwrap());
        drop(pool.fetch(4, FetchMode::Create).unwrap());

        let mut buf = vec![0u8; PAGE];
        assert!(store.read_page(1, &mut buf).unwrap());
        assert_eq!(buf[100], 0xCD);

        // and it reloads from the store
        let guard = pool.fetch(1, FetchMode::Existing).unwrap();
        assert_eq!(guard.read()[100], 0xCD);
    }

    #[test]
    fn test_pool_full_when_all_pinned() {
        let (pool, _) = create_test_pool(2);
        let _g1 = pool.fetch(1, FetchMode::Create).unwrap();
        let _g2 = pool.fetch(2, FetchMode::Create).unwrap();

        let result = pool.fetch(3, FetchMode::Create);
        assert!(matches!(result, Err(KilnError::BufferPoolFull)));
    }

    #[test]
    fn test_flush_all() {
        let (pool, store) = create_test_pool(8);
        for pgno in 0..5 {
            let guard = pool.fetch(pgno, FetchMode::Create).unwrap();
            guard.write()[0] = pgno as u8 + 1;
        }
        assert_eq!(pool.stats().dirty_frames, 5);

        assert_eq!(pool.flush_all().unwrap(), 5);
        assert_eq!(pool.stats().dirty_frames, 0);
        assert_eq!(pool.stats().pinned_frames, 0);
        assert_eq!(store.num_pages().unwrap(), 5);

        // nothing left to write
        assert_eq!(pool.flush_all().unwrap(), 0);
    }

    #[test]
    fn test_flush_page() {
        let (pool, _) = create_test_pool(4);
        assert!(!pool.flush_page(9).unwrap());

        let guard = pool.fetch(9, FetchMode::Create).unwrap();
        guard.write()[1] = 1;
        assert!(pool.flush_page(9).unwrap());
        assert!(!pool.flush_page(9).unwrap());
    }

    #[test]
    fn test_wal_barrier_sees_page_lsn() {
        let (pool, _) = create_test_pool(4);
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = seen.clone();
        pool.set_wal_barrier(Arc::new(move |lsn| {
            seen_clone.fetch_max(lsn, Ordering::SeqCst);
            Ok(())
        }));

        {
            let guard = pool.fetch(1, FetchMode::Create).unwrap();
            PageHeader::set_lsn(&mut guard.write(), 4242);
        }
        pool.flush_all().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4242);
    }

    #[test]
    fn test_wal_barrier_failure_keeps_page_dirty() {
        let (pool, _) = create_test_pool(4);
        pool.set_wal_barrier(Arc::new(|_| {
            Err(KilnError::WalWriteFailed("log offline".to_string()))
        }));

        {
            let guard = pool.fetch(2, FetchMode::Create).unwrap();
            guard.write()[0] = 1;
        }
        assert!(pool.flush_all().is_err());
        assert_eq!(pool.stats().dirty_frames, 1);
        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_concurrent_fetch() {
        let (pool, _) = create_test_pool(16);

        std::thread::scope(|s| {
            for t in 0..4u32 {
                let pool = &pool;
                s.spawn(move || {
                    for i in 0..200u32 {
                        let pgno = (i * 7 + t) % 40;
                        let guard = pool.fetch(pgno, FetchMode::Create).unwrap();
                        let mut data = guard.write();
                        data[0] = data[0].wrapping_add(1);
                    }
                });
            }
        });

        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_random_access_survives_eviction() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let (pool, _) = create_test_pool(8);
        let mut rng = StdRng::seed_from_u64(42);
        let mut expected = vec![0u8; 64];

        for _ in 0..2000 {
            let pgno = rng.gen_range(0..64u32);
            let guard = pool.fetch(pgno, FetchMode::Create).unwrap();
            if rng.gen_bool(0.5) {
                let value = rng.gen::<u8>();
                guard.write()[PAGE - 1] = value;
                expected[pgno as usize] = value;
            } else {
                assert_eq!(guard.read()[PAGE - 1], expected[pgno as usize], "page {}", pgno);
            }
        }
        assert_eq!(pool.stats().pinned_frames, 0);
    }
}
